//! Async SCPI client over TCP.
//!
//! Commands are ASCII lines terminated by `\n`; queries are answered with one
//! line, or with an IEEE 488.2 definite-length block (`#<n><len><data>`) for
//! waveform data.

use crate::address::Endpoint;
use anyhow::{bail, Context, Result};
use futures::FutureExt;
use la_core::limits::{MAX_CAPTURE_BYTES, MAX_LINE_BYTES};
use la_core::stream::{DynStream, LineReader};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Default SCPI port of LAN-enabled bench instruments.
pub const DEFAULT_PORT: u16 = 5555;

/// Default query timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Identity reported by `*IDN?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub manufacturer: String,
    pub model: String,
    pub serial: Option<String>,
    pub firmware: Option<String>,
}

impl Identity {
    /// Parse `manufacturer,model,serial,firmware`. Only the first two fields
    /// are required.
    pub fn parse(response: &str) -> Result<Self> {
        let mut fields = response.split(',').map(str::trim);
        let manufacturer = fields.next().filter(|s| !s.is_empty());
        let model = fields.next().filter(|s| !s.is_empty());
        let (Some(manufacturer), Some(model)) = (manufacturer, model) else {
            bail!("unrecognised *IDN? response '{}'", response.trim());
        };
        let owned = |s: Option<&str>| s.filter(|s| !s.is_empty()).map(str::to_string);
        Ok(Self {
            manufacturer: manufacturer.to_string(),
            model: model.to_string(),
            serial: owned(fields.next()),
            firmware: owned(fields.next()),
        })
    }
}

/// SCPI client over any byte stream (TCP in production).
pub struct ScpiClient {
    stream: Mutex<LineReader<DynStream>>,
    timeout: Duration,
}

impl ScpiClient {
    /// Connect to an instrument.
    pub async fn connect(endpoint: &Endpoint, connect_timeout: Duration) -> Result<Self> {
        let port = endpoint.socket_port()?;
        let stream = timeout(
            connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), port)),
        )
        .await
        .with_context(|| format!("Connection timeout to {}", endpoint))?
        .with_context(|| format!("Failed to connect to {}", endpoint))?;
        stream.set_nodelay(true)?;

        tracing::info!(endpoint = %endpoint, "SCPI instrument connected");
        Ok(Self::from_stream(Box::new(stream)))
    }

    /// Wrap an already-open stream.
    pub fn from_stream(stream: DynStream) -> Self {
        Self {
            stream: Mutex::new(LineReader::new(stream)),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    pub fn set_timeout(&mut self, duration: Duration) {
        self.timeout = duration;
    }

    /// Send a command without expecting a response.
    pub async fn write(&self, command: &str) -> Result<()> {
        let mut stream = self.stream.lock().await;
        Self::send(&mut stream, command).await
    }

    /// Send a query and return the trimmed reply line.
    pub async fn query(&self, query: &str) -> Result<String> {
        let mut stream = self.stream.lock().await;
        stream.discard_stale();
        Self::send(&mut stream, query).await?;

        // A late block terminator can show up as an empty line.
        let response = timeout(self.timeout, stream.read_nonempty_line(MAX_LINE_BYTES))
            .await
            .with_context(|| format!("No response to: {}", query))??;
        let trimmed = response.trim().to_string();
        tracing::debug!(query, response = %trimmed, "SCPI response");
        Ok(trimmed)
    }

    /// Send a query answered by a definite-length block and return its payload.
    pub async fn query_block(&self, query: &str) -> Result<Vec<u8>> {
        let mut stream = self.stream.lock().await;
        stream.discard_stale();
        Self::send(&mut stream, query).await?;
        timeout(self.timeout, read_definite_block(stream.buffered()))
            .await
            .with_context(|| format!("Timeout reading block for: {}", query))?
    }

    async fn send(stream: &mut LineReader<DynStream>, command: &str) -> Result<()> {
        tracing::debug!(command, "SCPI write");
        let line = format!("{}\n", command);
        stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to write command: {}", command))?;
        stream
            .get_mut()
            .flush()
            .await
            .context("Failed to flush stream")
    }
}

/// Read an IEEE 488.2 definite-length block, including its trailing newline.
pub async fn read_definite_block<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>> {
    let mut marker = reader.read_u8().await.context("block header missing")?;
    // Some instruments echo whitespace before the block.
    while marker.is_ascii_whitespace() {
        marker = reader.read_u8().await.context("block header missing")?;
    }
    if marker != b'#' {
        bail!("expected '#' block header, got {:?}", marker as char);
    }
    let digits = reader.read_u8().await.context("block header truncated")?;
    let digits = (digits as char)
        .to_digit(10)
        .filter(|d| *d > 0)
        .with_context(|| format!("invalid block length digit {:?}", digits as char))?;

    let mut len_text = vec![0u8; digits as usize];
    reader
        .read_exact(&mut len_text)
        .await
        .context("block length truncated")?;
    let len: usize = std::str::from_utf8(&len_text)
        .ok()
        .and_then(|s| s.parse().ok())
        .context("block length is not a number")?;
    if len > MAX_CAPTURE_BYTES {
        bail!("block of {} bytes exceeds the capture limit", len);
    }

    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .context("block data truncated")?;

    // Consume the terminator if it has already arrived.
    let skip = match reader.fill_buf().now_or_never() {
        Some(Ok(buf)) => buf.iter().take_while(|b| matches!(b, b'\n' | b'\r')).count(),
        _ => 0,
    };
    reader.consume(skip);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_identity_parse() {
        let id = Identity::parse("RIGOL TECHNOLOGIES,MSO5074,MS5A1234,00.01.02\n").unwrap();
        assert_eq!(id.manufacturer, "RIGOL TECHNOLOGIES");
        assert_eq!(id.model, "MSO5074");
        assert_eq!(id.serial.as_deref(), Some("MS5A1234"));
        assert_eq!(id.firmware.as_deref(), Some("00.01.02"));

        let short = Identity::parse("Siglent Technologies,SDS2104X Plus").unwrap();
        assert!(short.serial.is_none());

        assert!(Identity::parse("garbage").is_err());
        assert!(Identity::parse(",").is_err());
    }

    #[tokio::test]
    async fn test_read_definite_block() {
        let mut input: &[u8] = b"#15hello\nNEXT";
        let mut reader = BufReader::new(&mut input);
        let data = read_definite_block(&mut reader).await.unwrap();
        assert_eq!(data, b"hello");

        let mut rest = String::new();
        reader.read_line(&mut rest).await.unwrap();
        assert_eq!(rest, "NEXT");
    }

    #[tokio::test]
    async fn test_read_definite_block_rejects_bad_header() {
        let mut input: &[u8] = b"hello";
        assert!(read_definite_block(&mut BufReader::new(&mut input)).await.is_err());
        let mut input: &[u8] = b"#0";
        assert!(read_definite_block(&mut BufReader::new(&mut input)).await.is_err());
        let mut input: &[u8] = b"#210abc";
        assert!(read_definite_block(&mut BufReader::new(&mut input)).await.is_err());
    }

    #[tokio::test]
    async fn test_query_with_duplex() {
        let (host, device) = tokio::io::duplex(256);
        let fake = tokio::spawn(async move {
            let mut device = BufReader::new(device);
            let mut line = String::new();
            device.read_line(&mut line).await.unwrap();
            assert_eq!(line, "*IDN?\n");
            device
                .get_mut()
                .write_all(b"RIGOL TECHNOLOGIES,MSO5074,X,1\n")
                .await
                .unwrap();
            line.clear();
            device.read_line(&mut line).await.unwrap();
            assert_eq!(line, ":WAV:DATA?\n");
            device.get_mut().write_all(b"#3004\x01\x00\x01\x01\n").await.unwrap();
        });

        let client = ScpiClient::from_stream(Box::new(host));
        let idn = client.query("*IDN?").await.unwrap();
        assert!(idn.starts_with("RIGOL"));
        let block = client.query_block(":WAV:DATA?").await.unwrap();
        assert_eq!(block, vec![1, 0, 1, 1]);
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_reply_tail_is_skipped() {
        let (host, device) = tokio::io::duplex(256);
        let fake = tokio::spawn(async move {
            let mut device = BufReader::new(device);
            let mut line = String::new();
            device.read_line(&mut line).await.unwrap();
            assert_eq!(line, ":TRIG:STAT?\n");
            device.get_mut().write_all(b"WA").await.unwrap();

            line.clear();
            device.read_line(&mut line).await.unwrap();
            assert_eq!(line, ":TRIG:STAT?\n");
            device.get_mut().write_all(b"IT\nSTOP\n").await.unwrap();
        });

        let mut client = ScpiClient::from_stream(Box::new(host));
        client.set_timeout(Duration::from_millis(30));
        assert!(client.query(":TRIG:STAT?").await.is_err());
        assert_eq!(client.query(":TRIG:STAT?").await.unwrap(), "STOP");
        fake.await.unwrap();
    }
}
