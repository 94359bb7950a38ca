//! Command/response transport over a serial port.
//!
//! [`Transport`] is the byte-level seam: send a command, read a terminated line,
//! read a fixed number of bytes, purge. [`SerialTransport`] implements it over
//! any [`DynSerial`], keeping bytes that arrive after a terminator for the next
//! read until the next purge.
//!
//! [`SharedTransport`] is what drivers hold. Each `query_*` method locks the
//! transport for the whole exchange (purge, send, receive), so at most one
//! exchange is in flight per port.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{AdapterError, AdapterResult};
use crate::protocol::{Classified, Command, ResponseRules};
use crate::serial::{drain_serial_buffer, DynSerial};

/// Default exchange timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
/// Default bound on a single reply.
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 4096;
/// Default window used to drain stale bytes before a command.
pub const DEFAULT_PURGE_WINDOW: Duration = Duration::from_millis(10);

/// Timing and size limits for one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    /// Budget for a single receive.
    pub timeout: Duration,
    /// A line longer than this without a terminator fails.
    pub max_response_bytes: usize,
    /// How long purge keeps draining.
    pub purge_window: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            purge_window: DEFAULT_PURGE_WINDOW,
        }
    }
}

impl TransportSettings {
    /// Settings with a custom timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Byte-level command/response channel to one device.
#[async_trait]
pub trait Transport: Send {
    /// Write `command` followed by `terminator` and flush.
    async fn send(&mut self, command: &[u8], terminator: &[u8]) -> AdapterResult<()>;

    /// Read until `terminator`; the terminator is not included.
    async fn receive_line(&mut self, terminator: &[u8]) -> AdapterResult<String>;

    /// Read until `count` bytes or `timeout`. May return fewer bytes.
    async fn receive_fixed_length(
        &mut self,
        count: usize,
        timeout: Duration,
    ) -> AdapterResult<Vec<u8>>;

    /// Discard buffered and immediately readable bytes. Returns bytes dropped.
    async fn purge(&mut self) -> AdapterResult<usize>;

    /// Budget for a single receive.
    fn timeout(&self) -> Duration;
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// [`Transport`] over a serial port (or anything that looks like one).
pub struct SerialTransport {
    port: DynSerial,
    pending: Vec<u8>,
    settings: TransportSettings,
}

impl SerialTransport {
    /// Wrap an open port.
    pub fn new(port: DynSerial, settings: TransportSettings) -> Self {
        Self {
            port,
            pending: Vec::new(),
            settings,
        }
    }

    /// Read whatever arrives before `deadline` into the pending buffer.
    ///
    /// Returns `Ok(false)` when the deadline passes with nothing read.
    async fn fill(&mut self, deadline: Instant) -> AdapterResult<bool> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }

        let mut buf = [0u8; 256];
        match tokio::time::timeout(remaining, self.port.read(&mut buf)).await {
            Err(_) => Ok(false),
            Ok(Ok(0)) => Err(AdapterError::Communication(
                "serial port closed".to_string(),
            )),
            Ok(Ok(n)) => {
                trace!(bytes = n, "read from port");
                self.pending.extend_from_slice(&buf[..n]);
                Ok(true)
            }
            Ok(Err(e)) => Err(AdapterError::Communication(format!("read failed: {}", e))),
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&mut self, command: &[u8], terminator: &[u8]) -> AdapterResult<()> {
        let mut frame = Vec::with_capacity(command.len() + terminator.len());
        frame.extend_from_slice(command);
        frame.extend_from_slice(terminator);

        self.port
            .write_all(&frame)
            .await
            .map_err(|e| AdapterError::Communication(format!("write failed: {}", e)))?;
        self.port
            .flush()
            .await
            .map_err(|e| AdapterError::Communication(format!("flush failed: {}", e)))?;
        Ok(())
    }

    async fn receive_line(&mut self, terminator: &[u8]) -> AdapterResult<String> {
        if terminator.is_empty() {
            return Err(AdapterError::Configuration(
                "line terminator must not be empty".to_string(),
            ));
        }

        let deadline = Instant::now() + self.settings.timeout;
        loop {
            if let Some(pos) = find_subsequence(&self.pending, terminator) {
                let line: Vec<u8> = self.pending.drain(..pos + terminator.len()).collect();
                return Ok(String::from_utf8_lossy(&line[..pos]).into_owned());
            }

            if self.pending.len() > self.settings.max_response_bytes {
                let bytes = self.pending.len();
                self.pending.clear();
                return Err(AdapterError::ResponseTooLarge {
                    bytes,
                    max_bytes: self.settings.max_response_bytes,
                });
            }

            if !self.fill(deadline).await? {
                return Err(AdapterError::Timeout {
                    waited: self.settings.timeout,
                });
            }
        }
    }

    async fn receive_fixed_length(
        &mut self,
        count: usize,
        timeout: Duration,
    ) -> AdapterResult<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        while self.pending.len() < count {
            if !self.fill(deadline).await? {
                break;
            }
        }

        let take = count.min(self.pending.len());
        if take < count {
            debug!(expected = count, received = take, "short fixed-length reply");
        }
        Ok(self.pending.drain(..take).collect())
    }

    async fn purge(&mut self) -> AdapterResult<usize> {
        let carried = self.pending.len();
        self.pending.clear();
        let drained = drain_serial_buffer(&mut self.port, self.settings.purge_window).await;
        Ok(carried + drained)
    }

    fn timeout(&self) -> Duration {
        self.settings.timeout
    }
}

/// Cloneable handle to a transport, serializing exchanges.
///
/// The handle may start detached (no port yet); drivers open it during
/// initialization from their `Port` property.
#[derive(Clone)]
pub struct SharedTransport {
    inner: Arc<Mutex<Option<Box<dyn Transport>>>>,
    settings: TransportSettings,
    label: Arc<str>,
}

impl std::fmt::Debug for SharedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTransport")
            .field("label", &self.label)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SharedTransport {
    /// Handle over an existing transport.
    pub fn new(label: &str, transport: Box<dyn Transport>, settings: TransportSettings) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(transport))),
            settings,
            label: Arc::from(label),
        }
    }

    /// Handle over an already-open port.
    pub fn from_port(label: &str, port: DynSerial, settings: TransportSettings) -> Self {
        Self::new(label, Box::new(SerialTransport::new(port, settings)), settings)
    }

    /// Handle with no port attached yet.
    pub fn detached(label: &str, settings: TransportSettings) -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
            settings,
            label: Arc::from(label),
        }
    }

    /// Device label used in log fields.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Configured limits.
    pub fn settings(&self) -> TransportSettings {
        self.settings
    }

    /// Whether a port is attached.
    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Attach a port, replacing any previous one.
    pub async fn attach(&self, port: DynSerial) {
        let transport = SerialTransport::new(port, self.settings);
        *self.inner.lock().await = Some(Box::new(transport));
    }

    /// Open `port_path` unless a port is already attached.
    #[cfg(feature = "serial")]
    pub async fn open(&self, port_path: &str, baud_rate: u32) -> AdapterResult<()> {
        let mut guard = self.inner.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let stream = crate::serial::open_serial_async(port_path, baud_rate, &self.label)
            .await
            .map_err(|e| AdapterError::Communication(format!("{:#}", e)))?;
        *guard = Some(Box::new(SerialTransport::new(Box::new(stream), self.settings)));
        tracing::info!(device = %self.label, port = port_path, baud_rate, "serial port opened");
        Ok(())
    }

    /// Drop the attached port.
    pub async fn close(&self) {
        self.inner.lock().await.take();
    }

    async fn begin<'a>(
        &self,
        guard: &'a mut Option<Box<dyn Transport>>,
        command: &Command,
    ) -> AdapterResult<&'a mut Box<dyn Transport>> {
        let transport = guard.as_mut().ok_or_else(|| {
            AdapterError::Communication(format!("{}: serial port not open", self.label))
        })?;
        let purged = transport.purge().await?;
        if purged > 0 {
            debug!(device = %self.label, bytes = purged, "discarded stale bytes");
        }
        debug!(device = %self.label, command = %command, "send");
        transport
            .send(command.text().as_bytes(), command.terminator())
            .await?;
        Ok(transport)
    }

    /// Purge and send without reading a reply.
    pub async fn send_only(&self, command: &Command) -> AdapterResult<()> {
        let mut guard = self.inner.lock().await;
        self.begin(&mut guard, command).await?;
        Ok(())
    }

    /// Purge, send, read one line terminated by `reply_terminator`.
    #[tracing::instrument(level = "debug", skip_all, fields(device = %self.label, command = %command), err)]
    pub async fn query_line(
        &self,
        command: &Command,
        reply_terminator: &[u8],
    ) -> AdapterResult<String> {
        let mut guard = self.inner.lock().await;
        let transport = self.begin(&mut guard, command).await?;
        let line = transport.receive_line(reply_terminator).await?;
        debug!(device = %self.label, reply = %line.escape_debug(), "recv");
        Ok(line)
    }

    /// Purge, send, read exactly `count` bytes (or fewer on timeout).
    #[tracing::instrument(level = "debug", skip_all, fields(device = %self.label, command = %command), err)]
    pub async fn query_fixed(&self, command: &Command, count: usize) -> AdapterResult<String> {
        let mut guard = self.inner.lock().await;
        let transport = self.begin(&mut guard, command).await?;
        let timeout = transport.timeout();
        let bytes = transport.receive_fixed_length(count, timeout).await?;
        if bytes.is_empty() {
            return Err(AdapterError::Timeout { waited: timeout });
        }
        let reply = String::from_utf8_lossy(&bytes).into_owned();
        debug!(device = %self.label, reply = %reply.escape_debug(), "recv");
        Ok(reply)
    }

    /// Purge, send, then read lines until the acknowledgment token.
    ///
    /// Returns the data lines seen before the ack. Informational lines are
    /// skipped. If an error line shows up the scan keeps going to the ack so
    /// the device is left idle, then purges and returns the first error. The
    /// scan gives up after `max_lines` lines or the transport timeout.
    #[tracing::instrument(level = "debug", skip_all, fields(device = %self.label, command = %command), err)]
    pub async fn query_until_ack(
        &self,
        command: &Command,
        rules: &ResponseRules,
        reply_terminator: &[u8],
        max_lines: usize,
    ) -> AdapterResult<Vec<String>> {
        let mut guard = self.inner.lock().await;
        let transport = self.begin(&mut guard, command).await?;
        let budget = transport.timeout();

        let scan = async {
            let mut lines = Vec::new();
            let mut failure: Option<AdapterError> = None;

            for _ in 0..max_lines {
                let raw = match transport.receive_line(reply_terminator).await {
                    Ok(raw) => raw,
                    Err(e) => return Err(failure.unwrap_or(e)),
                };
                let line = raw.trim_matches(|c: char| c == '\r' || c == '\n');
                if line.is_empty() {
                    continue;
                }
                trace!(line = %line.escape_debug(), "scan");

                match rules.classify(line) {
                    Ok(Classified::Ack) => {
                        return match failure {
                            Some(e) => Err(e),
                            None => Ok(lines),
                        };
                    }
                    Ok(Classified::Info(_)) => {}
                    Ok(Classified::Data(data)) => lines.push(data.to_string()),
                    Err(e) => {
                        warn!(line = %line.escape_debug(), error = %e, "device reported error");
                        failure.get_or_insert(e);
                    }
                }
            }

            Err(failure.unwrap_or_else(|| {
                AdapterError::UnrecognizedResponse(format!(
                    "no acknowledgment within {} lines",
                    max_lines
                ))
            }))
        };

        let result = match tokio::time::timeout(budget, scan).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout { waited: budget }),
        };

        if result.is_err() {
            transport.purge().await?;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedPort;
    use crate::protocol::{DeviceErrorEntry, ErrorMarker, ErrorTable, CR, LF};
    use tokio::io::AsyncWriteExt;

    const ENTRIES: &[DeviceErrorEntry] = &[
        DeviceErrorEntry::benign("I", "info"),
        DeviceErrorEntry::fault("E", 103, "error"),
    ];
    const RULES: ResponseRules = ResponseRules::new(ErrorTable::new(ENTRIES))
        .with_error_marker(ErrorMarker {
            token: "%SYS-",
            offset: Some(0),
            code_len: Some(1),
        })
        .with_ack("[OK]");

    fn transport(port: DynSerial) -> SerialTransport {
        SerialTransport::new(port, TransportSettings::default())
    }

    #[tokio::test]
    async fn test_receive_line_keeps_carry_over() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut t = transport(Box::new(device));

        host.write_all(b"first\rsecond\r").await.unwrap();

        assert_eq!(t.receive_line(CR).await.unwrap(), "first");
        assert_eq!(t.receive_line(CR).await.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_receive_line_multibyte_terminator() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut t = transport(Box::new(device));

        host.write_all(b"0PO0000001F\r").await.unwrap();
        host.write_all(b"\n").await.unwrap();

        assert_eq!(t.receive_line(b"\r\n").await.unwrap(), "0PO0000001F");
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_line_times_out_without_terminator() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut t = transport(Box::new(device));

        host.write_all(b"never terminated").await.unwrap();

        let err = t.receive_line(CR).await.unwrap_err();
        assert_eq!(
            err,
            AdapterError::Timeout {
                waited: DEFAULT_TIMEOUT
            }
        );
    }

    #[tokio::test]
    async fn test_receive_line_bounded() {
        let (mut host, device) = tokio::io::duplex(256);
        let settings = TransportSettings {
            max_response_bytes: 16,
            ..Default::default()
        };
        let mut t = SerialTransport::new(Box::new(device), settings);

        host.write_all(&[b'x'; 64]).await.unwrap();

        let err = t.receive_line(CR).await.unwrap_err();
        assert!(matches!(err, AdapterError::ResponseTooLarge { max_bytes: 16, .. }));
    }

    #[tokio::test]
    async fn test_closed_port_is_communication_error() {
        let (host, device) = tokio::io::duplex(64);
        let mut t = transport(Box::new(device));
        drop(host);

        let err = t.receive_line(CR).await.unwrap_err();
        assert!(matches!(err, AdapterError::Communication(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_length_returns_short_data() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut t = transport(Box::new(device));

        host.write_all(b"\x0201S").await.unwrap();

        let bytes = t
            .receive_fixed_length(10, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(bytes, b"\x0201S");
    }

    #[tokio::test]
    async fn test_fixed_length_ignores_terminators() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut t = transport(Box::new(device));

        host.write_all(b"ab\rcd\rEXTRA").await.unwrap();

        let bytes = t
            .receive_fixed_length(6, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(bytes, b"ab\rcd\r");
        // leftover stays for the next read until purged
        assert_eq!(t.purge().await.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_line_purges_stale_bytes() {
        let (port, script) = ScriptedPort::new(LF);
        script.on("POS? Z", "Z=12.5\n");
        script.push_unsolicited(b"garbage\n");

        let shared = SharedTransport::from_port("test", Box::new(port), Default::default());
        let cmd = Command::new("POS?").separator(" ").param("Z").terminated(LF);

        assert_eq!(shared.query_line(&cmd, LF).await.unwrap(), "Z=12.5");
        assert_eq!(script.writes(), vec!["POS? Z"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_fixed_reads_by_count() {
        let (port, script) = ScriptedPort::new(CR);
        script.on("0DIA", "\x0200S12.34\x03\x0200S");
        script.on("0DIR", "\x0200S");

        let shared = SharedTransport::from_port("test", Box::new(port), Default::default());

        let reply = shared.query_fixed(&Command::new("0DIA"), 10).await.unwrap();
        assert_eq!(reply, "\x0200S12.34\x03");

        // short replies come back as they are once the budget runs out
        let reply = shared.query_fixed(&Command::new("0DIR"), 8).await.unwrap();
        assert_eq!(reply, "\x0200S");
        assert_eq!(script.writes(), vec!["0DIA", "0DIR"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_fixed_silent_device_times_out() {
        let (port, _script) = ScriptedPort::new(CR);
        let shared = SharedTransport::from_port("test", Box::new(port), Default::default());

        let err = shared
            .query_fixed(&Command::new("0RAT"), 12)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_until_ack_collects_data() {
        let (port, script) = ScriptedPort::new(CR);
        script.on("sh level pow", "\r\nCH1, PWR: 5.0 mW\r\n%SYS-I-001 note\r\n[OK]\r\n");

        let shared = SharedTransport::from_port("test", Box::new(port), Default::default());
        let lines = shared
            .query_until_ack(&Command::new("sh level pow"), &RULES, CR, 8)
            .await
            .unwrap();
        assert_eq!(lines, vec!["CH1, PWR: 5.0 mW"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_until_ack_returns_device_error() {
        let (port, script) = ScriptedPort::new(CR);
        script.on("la on", "%SYS-E-113 interlock\r\n[OK]\r\n");

        let shared = SharedTransport::from_port("test", Box::new(port), Default::default());
        let err = shared
            .query_until_ack(&Command::new("la on"), &RULES, CR, 8)
            .await
            .unwrap_err();
        assert_eq!(err.code(), 103);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_until_ack_is_bounded() {
        let (port, script) = ScriptedPort::new(CR);
        script.on("id", "a\rb\rc\rd\re\r");

        let shared = SharedTransport::from_port("test", Box::new(port), Default::default());
        let err = shared
            .query_until_ack(&Command::new("id"), &RULES, CR, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::UnrecognizedResponse(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out() {
        let (port, script) = ScriptedPort::new(CR);
        let shared = SharedTransport::from_port("test", Box::new(port), Default::default());

        let err = shared
            .query_until_ack(&Command::new("sta la"), &RULES, CR, 8)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Timeout { .. }));
        assert_eq!(script.write_count(), 1);
    }

    #[tokio::test]
    async fn test_detached_transport_refuses_exchange() {
        let shared = SharedTransport::detached("test", Default::default());
        assert!(!shared.is_open().await);
        let err = shared
            .query_line(&Command::new("id"), CR)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Communication(_)));
    }
}
