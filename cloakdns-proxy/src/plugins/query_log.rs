//! Query and NXDOMAIN logging.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::LogFormat;
use crate::error::Result;
use crate::plugins::{Plugin, PluginsState};

/// Append-only event sink shared by the logging plugins.
pub struct EventLogger {
    file: Mutex<File>,
    format: LogFormat,
}

impl EventLogger {
    pub fn open(path: &Path, format: LogFormat) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            format,
        })
    }

    pub fn log(&self, client: &std::net::SocketAddr, qname: &str, qtype: &str, note: &str) {
        let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = match self.format {
            LogFormat::Tsv => format!("{ts}\t{client}\t{qname}\t{qtype}\t{note}\n"),
            LogFormat::Ltsv => {
                format!("time:{ts}\thost:{client}\tqname:{qname}\ttype:{qtype}\tmessage:{note}\n")
            }
        };
        if let Err(e) = self.file.lock().write_all(line.as_bytes()) {
            debug!("event log write failed: {e}");
        }
    }
}

/// Logs every incoming question.
pub struct QueryLog {
    logger: EventLogger,
    ignored_qtypes: Vec<String>,
}

impl QueryLog {
    pub fn new(logger: EventLogger, ignored_qtypes: Vec<String>) -> Self {
        Self {
            logger,
            ignored_qtypes,
        }
    }
}

#[async_trait]
impl Plugin for QueryLog {
    fn name(&self) -> &'static str {
        "query_log"
    }

    async fn apply(&self, state: &mut PluginsState, _packet: &mut Vec<u8>) -> Result<()> {
        let qtype = state.qtype.to_string();
        if self
            .ignored_qtypes
            .iter()
            .any(|t| t.eq_ignore_ascii_case(&qtype))
        {
            return Ok(());
        }
        self.logger
            .log(&state.client_addr, &state.qname, &qtype, "");
        Ok(())
    }
}

/// Logs responses that came back NXDOMAIN.
pub struct NxLog {
    logger: EventLogger,
}

impl NxLog {
    pub fn new(logger: EventLogger) -> Self {
        Self { logger }
    }
}

#[async_trait]
impl Plugin for NxLog {
    fn name(&self) -> &'static str {
        "nx_log"
    }

    async fn apply(&self, state: &mut PluginsState, packet: &mut Vec<u8>) -> Result<()> {
        // RCODE lives in the low nibble of the fourth header byte.
        if packet.len() >= 4 && packet[3] & 0x0f == 0x03 {
            self.logger
                .log(&state.client_addr, &state.qname, &state.qtype.to_string(), "NXDOMAIN");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::tests::{client_addr, query_packet};
    use crate::plugins::ClientProto;
    use hickory_proto::rr::RecordType;

    #[tokio::test]
    async fn logs_queries_and_skips_ignored_qtypes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("query.log");
        let plugin = QueryLog::new(
            EventLogger::open(&path, LogFormat::Tsv).unwrap(),
            vec!["AAAA".into()],
        );

        let packet = query_packet("example.com.", RecordType::A);
        let mut state = PluginsState::new(&packet, ClientProto::Udp, client_addr()).unwrap();
        plugin.apply(&mut state, &mut packet.clone()).await.unwrap();

        let aaaa = query_packet("six.example.com.", RecordType::AAAA);
        let mut state = PluginsState::new(&aaaa, ClientProto::Udp, client_addr()).unwrap();
        plugin.apply(&mut state, &mut aaaa.clone()).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("example.com\tA"));
        assert!(!contents.contains("six.example.com"));
    }

    #[tokio::test]
    async fn nx_log_only_fires_on_nxdomain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nx.log");
        let plugin = NxLog::new(EventLogger::open(&path, LogFormat::Ltsv).unwrap());

        let query = query_packet("gone.example.com.", RecordType::A);
        let mut state = PluginsState::new(&query, ClientProto::Udp, client_addr()).unwrap();

        let mut ok_response = query.clone();
        ok_response[2] |= 0x80; // QR
        plugin.apply(&mut state, &mut ok_response).await.unwrap();

        let mut nx_response = query.clone();
        nx_response[2] |= 0x80;
        nx_response[3] |= 0x03;
        plugin.apply(&mut state, &mut nx_response).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.matches("gone.example.com").count(), 1);
        assert!(contents.contains("message:NXDOMAIN"));
    }
}
