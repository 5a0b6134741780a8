//! End-to-end test of the [Driver] event loop over an in-memory pipe.

use bytes::Bytes;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use weft::driver::Driver;
use weft::{MetadataField, Role, Transport, TransportConfig, TransportEvent};

fn fields(pairs: &[(&str, &str)]) -> Vec<MetadataField> {
    pairs
        .iter()
        .map(|(n, v)| {
            (
                Bytes::copy_from_slice(n.as_bytes()),
                Bytes::copy_from_slice(v.as_bytes()),
            )
        })
        .collect()
}

async fn wait_for<F>(events: &mut mpsc::Receiver<TransportEvent>, mut pred: F) -> TransportEvent
where
    F: FnMut(&TransportEvent) -> bool,
{
    loop {
        let ev = events.recv().await.expect("event channel closed");
        if pred(&ev) {
            return ev;
        }
    }
}

#[tokio::test]
async fn echo_call_over_duplex() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_driver, client, mut client_events) = Driver::new(
        Transport::new(Role::Client, TransportConfig::default()),
        client_io,
    );
    let (server_driver, server, mut server_events) = Driver::new(
        Transport::new(Role::Server, TransportConfig::default()),
        server_io,
    );

    let client_side = async {
        let id = client.open_stream().await.unwrap();
        client
            .send_initial_metadata(id, fields(&[(":path", "/echo.Echo/Ping")]))
            .await
            .unwrap();
        client
            .send_message(id, Bytes::from_static(b"marco"), true)
            .await
            .unwrap();

        // A user ping round-trips while the call is in flight.
        client.ping().await.unwrap();

        wait_for(&mut client_events, |ev| {
            matches!(ev, TransportEvent::MessageReady { .. })
        })
        .await;
        let reply = client.take_message(id).await.expect("echoed message");
        assert_eq!(reply.as_ref(), b"marco");
        wait_for(&mut client_events, |ev| {
            matches!(ev, TransportEvent::StreamClosed { .. })
        })
        .await;

        client.shutdown(false).await;
    };

    let server_side = async {
        let ev = wait_for(&mut server_events, |ev| {
            matches!(ev, TransportEvent::InitialMetadata { .. })
        })
        .await;
        let TransportEvent::InitialMetadata { stream_id, fields: md, .. } = ev else {
            unreachable!()
        };
        assert_eq!(md[0].1.as_ref(), b"/echo.Echo/Ping");

        wait_for(&mut server_events, |ev| {
            matches!(ev, TransportEvent::MessageReady { .. })
        })
        .await;
        let msg = server.take_message(stream_id).await.expect("request");

        server
            .send_initial_metadata(stream_id, fields(&[(":status", "200")]))
            .await
            .unwrap();
        server.send_message(stream_id, msg, false).await.unwrap();
        server
            .send_trailing_metadata(stream_id, fields(&[("grpc-status", "0")]))
            .await
            .unwrap();

        wait_for(&mut server_events, |ev| {
            matches!(ev, TransportEvent::StreamClosed { .. })
        })
        .await;
        server.shutdown(false).await;
    };

    let (client_run, server_run, _) = tokio::join!(client_driver.run(), server_driver.run(), async {
        tokio::join!(client_side, server_side)
    });
    client_run.unwrap();
    server_run.unwrap();
}
