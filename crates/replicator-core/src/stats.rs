use crate::metrics::Counter;
use std::io;
use tokio::net::UdpSocket;
use tracing::warn;

/// Formats one graphite plaintext line: `<path> <value> <epoch_seconds>`.
pub fn graphite_line(namespace: &str, path: &[&str], value: u64, epoch_seconds: u64) -> String {
    let mut full = String::with_capacity(namespace.len() + 32);
    full.push_str(namespace);
    for segment in path {
        full.push('.');
        full.push_str(segment);
    }
    format!("{full} {value} {epoch_seconds}")
}

/// Lines for one drained time bucket.
pub fn bucket_lines(
    namespace: &str,
    db_alias: &str,
    second: u64,
    counters: &[(Counter, u64)],
) -> Vec<String> {
    counters
        .iter()
        .map(|(counter, value)| {
            graphite_line(namespace, &[db_alias, counter.name()], *value, second)
        })
        .collect()
}

/// Lines for one table's running totals, stamped with the current second.
pub fn table_lines(
    namespace: &str,
    db_alias: &str,
    table: &str,
    now_secs: u64,
    counters: &[(Counter, u64)],
) -> Vec<String> {
    counters
        .iter()
        .map(|(counter, value)| {
            graphite_line(namespace, &[db_alias, table, counter.name()], *value, now_secs)
        })
        .collect()
}

/// Pushes newline-joined graphite lines over a datagram socket, one
/// datagram per flush. Send failures are logged and dropped; stats are
/// best-effort and never stall the pipeline.
pub struct StatsEmitter {
    socket: UdpSocket,
    endpoint: String,
}

impl StatsEmitter {
    pub async fn bind(endpoint: impl Into<String>) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            socket,
            endpoint: endpoint.into(),
        })
    }

    pub async fn emit(&self, lines: &[String]) {
        if lines.is_empty() {
            return;
        }
        let payload = lines.join("\n") + "\n";
        if let Err(err) = self.socket.send_to(payload.as_bytes(), &self.endpoint).await {
            warn!(endpoint = %self.endpoint, "failed to push stats datagram: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_format_is_path_value_timestamp() {
        let line = graphite_line("replication", &["shop3", "rows_committed"], 42, 1_448_496_010);
        assert_eq!(line, "replication.shop3.rows_committed 42 1448496010");
    }

    #[test]
    fn table_lines_nest_the_table_segment() {
        let lines = table_lines(
            "replication",
            "shop",
            "orders",
            100,
            &[(Counter::RowsCommitted, 7)],
        );
        assert_eq!(lines, vec!["replication.shop.orders.rows_committed 7 100"]);
    }

    #[tokio::test]
    async fn emitter_sends_one_datagram_per_flush() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = receiver.local_addr().unwrap().to_string();
        let emitter = StatsEmitter::bind(&endpoint).await.unwrap();

        emitter
            .emit(&["a.b 1 10".to_string(), "a.c 2 10".to_string()])
            .await;

        let mut buf = [0u8; 256];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"a.b 1 10\na.c 2 10\n");
    }
}
