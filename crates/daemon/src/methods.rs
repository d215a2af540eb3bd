//! Built-in RPC methods

use flowline_core::RequestGovernor;
use flowline_transport::{Params, RpcError, TransportManager};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

/// Register `ping`, `limiter.stats` and `shutdown`
pub fn register<R, W>(transport: &TransportManager<R, W>, governor: Arc<RequestGovernor>)
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    transport.register_handler("ping", |_params: Params| async { Ok(json!({})) });

    transport.register_handler("limiter.stats", move |_params: Params| {
        let governor = Arc::clone(&governor);
        async move { Ok::<Value, RpcError>(serde_json::to_value(governor.stats())?) }
    });

    let stop = transport.stop_handle();
    transport.register_handler("shutdown", move |_params: Params| {
        let stop = stop.clone();
        async move {
            info!("Shutdown requested by peer");
            stop.stop();
            Ok::<Value, RpcError>(Value::Null)
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::{RateLimitConfig, RetryConfig};
    use flowline_transport::{FramedReader, FramedWriter};
    use std::time::Duration;
    use tokio::io::DuplexStream;

    fn setup() -> (
        TransportManager<DuplexStream, DuplexStream>,
        FramedWriter<DuplexStream>,
        FramedReader<DuplexStream>,
    ) {
        let (client_out, server_in) = tokio::io::duplex(4096);
        let (server_out, client_in) = tokio::io::duplex(4096);

        let transport = TransportManager::new(server_in, server_out);
        let governor =
            Arc::new(RequestGovernor::new(&RateLimitConfig::default(), RetryConfig::default()).unwrap());
        register(&transport, governor);

        (
            transport,
            FramedWriter::new(client_out),
            FramedReader::new(client_in),
        )
    }

    #[tokio::test]
    async fn test_ping_and_stats() {
        let (transport, client, mut replies) = setup();
        let task = tokio::spawn(transport.run());

        let ping_id = client.send("ping", None).await.unwrap();
        let reply = replies.next_message().await.unwrap().unwrap();
        assert_eq!(reply.id, Some(ping_id));
        assert_eq!(reply.result, Some(json!({})));

        let stats_id = client.send("limiter.stats", None).await.unwrap();
        let reply = replies.next_message().await.unwrap().unwrap();
        assert_eq!(reply.id, Some(stats_id));
        let stats = reply.result.unwrap();
        assert_eq!(stats["total_requests"], json!(0));
        assert_eq!(stats["refill_rate"], json!(10.0));

        client.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_notification_stops_transport() {
        let (transport, client, mut replies) = setup();
        let task = tokio::spawn(transport.run());

        client.send_notification("shutdown", None).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("transport did not stop")
            .unwrap()
            .unwrap();

        // No reply to a notification; the stream just closes
        assert!(replies.next_message().await.unwrap().is_none());
    }
}
