//! GPIO microcontroller peer: the async request/response client.
//!
//! [`GpioPeer`] is the seam the kernel talks to (motor commands, vibration
//! reads, watchdog feeds).  [`GpioController`] implements it over any byte
//! stream: a serial device, a TCP serial bridge, or an in-memory duplex pipe
//! in tests.  Only one request is outstanding at a time; each waits at most
//! `response_timeout` for its answer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use photon_types::PhotonError;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, instrument, warn};

use crate::gpio_protocol::{GpioCommand, GpioResponse};

/// Default time to wait for a response line.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Anything that can answer GPIO protocol requests.
#[async_trait]
pub trait GpioPeer: Send + Sync {
    /// Whether a link to the peer is currently open.
    fn is_connected(&self) -> bool;

    /// Perform one synchronous round-trip.
    ///
    /// # Errors
    ///
    /// - [`PhotonError::NotConnected`] – no link is open.
    /// - [`PhotonError::Timeout`] – no matching response within the deadline.
    /// - [`PhotonError::HardwareFault`] – the peer answered `ERROR:<msg>`.
    async fn request(&self, command: GpioCommand) -> Result<GpioResponse, PhotonError>;

    /// Set the motor PWM duty; `0` stops the motor.
    async fn set_motor_speed(&self, pwm: u8) -> Result<(), PhotonError> {
        self.request(GpioCommand::MotorSpeed(pwm)).await.map(|_| ())
    }

    /// Feed the hardware watchdog.
    async fn reset_watchdog(&self) -> Result<(), PhotonError> {
        self.request(GpioCommand::WdtReset).await.map(|_| ())
    }

    /// Read the current vibration magnitude in g.
    async fn read_vibration(&self) -> Result<f32, PhotonError> {
        match self.request(GpioCommand::GetVibrationLevel).await? {
            GpioResponse::Vibration(g) => Ok(g),
            other => Err(PhotonError::Protocol(format!(
                "expected vibration reading, got {other:?}"
            ))),
        }
    }
}

struct Link {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Replies still owed by the peer for requests that timed out.
    unanswered: u32,
}

/// Line-protocol client for the GPIO microcontroller.
pub struct GpioController {
    link: Mutex<Option<Link>>,
    connected: AtomicBool,
    response_timeout: Duration,
}

impl GpioController {
    pub fn new(response_timeout: Duration) -> Self {
        Self {
            link: Mutex::new(None),
            connected: AtomicBool::new(false),
            response_timeout,
        }
    }

    /// Attach an already-open byte stream, replacing any previous link.
    pub async fn connect<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        *self.link.lock().await = Some(Link {
            reader: BufReader::new(reader),
            writer: Box::new(writer),
            unanswered: 0,
        });
        self.connected.store(true, Ordering::Release);
        info!("GPIO peer connected");
    }

    /// Open a TCP connection to a serial-to-network bridge at `addr`
    /// (`host:port`).
    pub async fn connect_tcp(&self, addr: &str) -> Result<(), PhotonError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| PhotonError::NotConnected(format!("GPIO bridge {addr}: {e}")))?;
        stream.set_nodelay(true)?;
        self.connect(stream).await;
        Ok(())
    }

    /// Close the link.  Stop the watchdog heartbeat before calling this.
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        if self.link.lock().await.take().is_some() {
            info!("GPIO peer disconnected");
        }
    }

    #[instrument(skip(self), fields(cmd = %command.encode()))]
    async fn round_trip(&self, command: GpioCommand) -> Result<GpioResponse, PhotonError> {
        let mut guard = self.link.lock().await;
        let Some(link) = guard.as_mut() else {
            return Err(PhotonError::NotConnected("GPIO peer".to_string()));
        };

        let result = match settle(link, self.response_timeout).await {
            Ok(()) => exchange(link, command, Instant::now() + self.response_timeout).await,
            Err(e) => Err(e),
        };
        if matches!(result, Err(PhotonError::Timeout(_))) {
            link.unanswered += 1;
        }

        if matches!(result, Err(PhotonError::NotConnected(_)) | Err(PhotonError::Io(_))) {
            warn!("GPIO link lost; dropping connection");
            *guard = None;
            self.connected.store(false, Ordering::Release);
        }
        result
    }
}

impl Default for GpioController {
    fn default() -> Self {
        Self::new(DEFAULT_RESPONSE_TIMEOUT)
    }
}

/// Consume the replies owed for timed-out requests so none of them can be
/// taken as the answer to the next request.  A peer that stays silent for a
/// whole response window is assumed to have dropped them.
async fn settle(link: &mut Link, window: Duration) -> Result<(), PhotonError> {
    while link.unanswered > 0 {
        match read_response(link, Instant::now() + window).await {
            Ok(response) => {
                debug!(?response, "discarding late GPIO response");
                link.unanswered -= 1;
            }
            Err(PhotonError::Timeout(_)) => {
                debug!(owed = link.unanswered, "late GPIO responses never arrived");
                link.unanswered = 0;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn exchange(
    link: &mut Link,
    command: GpioCommand,
    deadline: Instant,
) -> Result<GpioResponse, PhotonError> {
    let line = format!("{}\n", command.encode());
    link.writer.write_all(line.as_bytes()).await?;
    link.writer.flush().await?;

    loop {
        let response = read_response(link, deadline).await.map_err(|e| match e {
            PhotonError::Timeout(_) => {
                PhotonError::Timeout(format!("no response to {}", command.encode()))
            }
            other => other,
        })?;
        if command.accepts(&response) {
            return Ok(response);
        }
        // Unsolicited line that does not echo this request.
        debug!(?response, "discarding stale GPIO response");
    }
}

/// Next well-formed response line, skipping blank and malformed ones.
async fn read_response(link: &mut Link, deadline: Instant) -> Result<GpioResponse, PhotonError> {
    loop {
        let mut buf = String::new();
        let read = timeout_at(deadline, link.reader.read_line(&mut buf))
            .await
            .map_err(|_| PhotonError::Timeout("GPIO response".to_string()))?;
        if read? == 0 {
            return Err(PhotonError::NotConnected("GPIO peer closed the link".to_string()));
        }
        if buf.trim().is_empty() {
            continue;
        }
        match GpioResponse::parse(&buf) {
            Ok(r) => return Ok(r),
            Err(e) => warn!(error = %e, "ignoring malformed GPIO line"),
        }
    }
}

#[async_trait]
impl GpioPeer for GpioController {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn request(&self, command: GpioCommand) -> Result<GpioResponse, PhotonError> {
        match self.round_trip(command).await? {
            GpioResponse::Error(msg) => Err(PhotonError::hardware("gpio", msg)),
            response => Ok(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimGpio;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    async fn controller_with_sim(sim: SimGpio) -> GpioController {
        let (host, device) = tokio::io::duplex(256);
        tokio::spawn(sim.serve(device));
        let controller = GpioController::new(Duration::from_millis(200));
        controller.connect(host).await;
        controller
    }

    #[tokio::test]
    async fn round_trips_against_simulated_peer() {
        let sim = SimGpio::new();
        sim.set_vibration(1.1);
        let controller = controller_with_sim(sim.clone()).await;

        controller.set_motor_speed(200).await.unwrap();
        controller.reset_watchdog().await.unwrap();
        let g = controller.read_vibration().await.unwrap();
        assert!((g - 1.1).abs() < 1e-6);
        assert_eq!(sim.motor_speed(), 200);
        assert_eq!(sim.heartbeat_count(), 1);
    }

    #[tokio::test]
    async fn not_connected_before_connect() {
        let controller = GpioController::default();
        assert!(!controller.is_connected());
        let err = controller.reset_watchdog().await.unwrap_err();
        assert!(matches!(err, PhotonError::NotConnected(_)));
    }

    #[tokio::test]
    async fn error_response_becomes_hardware_fault() {
        let sim = SimGpio::new();
        sim.fail_heartbeats(1);
        let controller = controller_with_sim(sim).await;
        let err = controller.reset_watchdog().await.unwrap_err();
        assert!(matches!(err, PhotonError::HardwareFault { .. }));
        // The next feed succeeds again.
        controller.reset_watchdog().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let (host, _device) = tokio::io::duplex(256);
        let controller = GpioController::new(Duration::from_millis(100));
        controller.connect(host).await;
        let err = controller.reset_watchdog().await.unwrap_err();
        assert!(matches!(err, PhotonError::Timeout(_)));
        assert!(controller.is_connected());
    }

    #[tokio::test]
    async fn stale_lines_are_skipped() {
        let (host, device) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let (r, mut w) = tokio::io::split(device);
            let mut lines = BufReader::new(r).lines();
            while let Ok(Some(_)) = lines.next_line().await {
                // A leftover answer from an earlier exchange, then the real one.
                w.write_all(b"OK:MOTOR_SPEED:10\nOK:WDT_RESET\n").await.unwrap();
            }
        });
        let controller = GpioController::new(Duration::from_millis(200));
        controller.connect(host).await;
        controller.reset_watchdog().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_is_not_taken_for_the_next_read() {
        let (host, device) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let (r, mut w) = tokio::io::split(device);
            let mut lines = BufReader::new(r).lines();
            // First read is answered after the host gave up on it.
            lines.next_line().await.unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
            w.write_all(b"VIBRATION:2.0\n").await.unwrap();
            // Second read is answered promptly.
            lines.next_line().await.unwrap();
            w.write_all(b"VIBRATION:0.1\n").await.unwrap();
            // Keep the link open.
            while let Ok(Some(_)) = lines.next_line().await {}
        });
        let controller = GpioController::new(Duration::from_millis(100));
        controller.connect(host).await;

        let first = controller.read_vibration().await;
        assert!(matches!(first, Err(PhotonError::Timeout(_))));
        let second = controller.read_vibration().await.unwrap();
        assert!((second - 0.1).abs() < 1e-6, "read {second}, expected the fresh sample");
    }

    #[tokio::test(start_paused = true)]
    async fn lost_reply_does_not_desync_the_link() {
        let (host, device) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let (r, mut w) = tokio::io::split(device);
            let mut lines = BufReader::new(r).lines();
            // The first request is swallowed; everything after is answered.
            lines.next_line().await.unwrap();
            while let Ok(Some(_)) = lines.next_line().await {
                w.write_all(b"OK:WDT_RESET\n").await.unwrap();
            }
        });
        let controller = GpioController::new(Duration::from_millis(100));
        controller.connect(host).await;

        assert!(matches!(
            controller.reset_watchdog().await,
            Err(PhotonError::Timeout(_))
        ));
        controller.reset_watchdog().await.unwrap();
        controller.reset_watchdog().await.unwrap();
        assert!(controller.is_connected());
    }

    #[tokio::test]
    async fn peer_hangup_marks_disconnected() {
        let (host, device) = tokio::io::duplex(256);
        drop(device);
        let controller = GpioController::new(Duration::from_millis(200));
        controller.connect(host).await;
        assert!(controller.reset_watchdog().await.is_err());
        assert!(!controller.is_connected());
    }
}
