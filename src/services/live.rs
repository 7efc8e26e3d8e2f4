//! Live update receiver: connection state machine, frame decoding and the reconnect driver.
//!
//! ```text
//! CONNECTING -> OPEN -> (frame* | error) -> CLOSED -> CONNECTING   (automatic retry)
//!                                         \-> CLOSED                (deliberate, terminal)
//! ```
//!
//! The state machine is plain data so the reconnect policy can be tested without a socket. The driver
//! runs it on its own thread and hands decoded updates to a sink; it never touches the view itself.

use crate::channel::{Frame, PushConnection, PushConnector};
use crate::error::{DecodeError, SyncError};
use crate::models::fermentation::{LiveUpdateMessage, PUSH_FRAME_UPDATE, PushFrame};
use crate::utils::{decode_json, decode_value};
use log::{debug, info, warn};
use rand::Rng;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Granularity at which a backoff sleep checks for a deliberate close.
const CLOSE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed { deliberate: bool },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    /// Extra random delay as a fraction of the base delay.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial.saturating_mul(1u32 << exp).min(self.max)
    }

    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 + rng.random_range(0.0..=self.jitter);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }
}

/// Updates decoded from one frame. Elements that failed to decode are reported separately.
#[derive(Debug, Default, PartialEq)]
pub struct DecodedFrame {
    pub updates: Vec<LiveUpdateMessage>,
    pub rejected: Vec<DecodeError>,
}

pub struct LiveUpdateReceiver {
    state: ChannelState,
    failures: u32,
    backoff: Backoff,
}

impl LiveUpdateReceiver {
    pub fn new(backoff: Backoff) -> Self {
        LiveUpdateReceiver {
            state: ChannelState::Closed { deliberate: false },
            failures: 0,
            backoff,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Consecutive failed connections since the last successful open.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Enter CONNECTING. Refused once the channel was closed deliberately.
    pub fn begin_connect(&mut self) -> bool {
        match self.state {
            ChannelState::Closed { deliberate: true } => false,
            _ => {
                self.state = ChannelState::Connecting;
                true
            }
        }
    }

    pub fn on_open(&mut self) {
        self.state = ChannelState::Open;
        self.failures = 0;
    }

    /// Error or unexpected close. A deliberate close already in place wins.
    pub fn on_failure(&mut self) {
        if self.state != (ChannelState::Closed { deliberate: true }) {
            self.state = ChannelState::Closed { deliberate: false };
            self.failures = self.failures.saturating_add(1);
        }
    }

    pub fn close(&mut self) {
        self.state = ChannelState::Closed { deliberate: true };
    }

    pub fn should_reconnect(&self) -> bool {
        self.state == ChannelState::Closed { deliberate: false }
    }

    pub fn next_delay<R: Rng>(&self, rng: &mut R) -> Duration {
        self.backoff.delay(self.failures.max(1), rng)
    }

    /// Decode one text frame. A frame that is not valid JSON is an error; the caller drops it and
    /// keeps the connection.
    pub fn on_frame(&self, text: &str) -> Result<DecodedFrame, DecodeError> {
        let frame: PushFrame = decode_json("push frame", text)?;
        if frame.kind != PUSH_FRAME_UPDATE {
            debug!("Live: ignoring frame of type {:?}", frame.kind);
            return Ok(DecodedFrame::default());
        }

        let mut decoded = DecodedFrame::default();
        for (index, element) in frame.data.into_iter().enumerate() {
            match decode_value::<LiveUpdateMessage>(&format!("push update #{}", index), element) {
                Ok(update) => decoded.updates.push(update),
                Err(e) => decoded.rejected.push(e),
            }
        }
        Ok(decoded)
    }
}

/// What the driver reports back to its owner.
#[derive(Debug, PartialEq)]
pub enum LiveEvent {
    /// A connection attempt is starting, including every retry.
    Connecting,
    Opened,
    Updates(Vec<LiveUpdateMessage>),
    Rejected(SyncError),
    Closed { deliberate: bool, reason: Option<String> },
}

/// Handle to a running channel thread. Dropping it closes the channel deliberately.
pub struct ChannelHandle {
    closing: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    /// Mark the close as deliberate. The thread notices within one read interval and exits without
    /// reconnecting.
    pub fn close(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Close and wait for the thread to exit.
    pub fn join(mut self) {
        self.close();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Spawn the channel driver. `sink` returns `false` once nobody listens any more, which stops the
/// thread as well.
pub fn spawn_channel<C, F>(connector: Arc<C>, backoff: Backoff, sink: F) -> io::Result<ChannelHandle>
where
    C: PushConnector,
    F: FnMut(LiveEvent) -> bool + Send + 'static,
{
    let closing = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&closing);
    let thread = thread::Builder::new()
        .name("push-channel".into())
        .spawn(move || drive(connector.as_ref(), LiveUpdateReceiver::new(backoff), &flag, sink))?;
    Ok(ChannelHandle {
        closing,
        thread: Some(thread),
    })
}

fn drive<C, F>(connector: &C, mut receiver: LiveUpdateReceiver, closing: &AtomicBool, mut sink: F)
where
    C: PushConnector,
    F: FnMut(LiveEvent) -> bool,
{
    let mut rng = rand::rng();
    loop {
        if closing.load(Ordering::SeqCst) || !receiver.begin_connect() {
            break;
        }

        if !sink(LiveEvent::Connecting) {
            return;
        }
        let reason = match connector.connect() {
            Ok(mut conn) => {
                receiver.on_open();
                info!("Live: push channel open");
                if !sink(LiveEvent::Opened) {
                    conn.close();
                    return;
                }
                match pump_connection(&mut conn, &receiver, closing, &mut sink) {
                    ConnectionEnd::Deliberate => {
                        conn.close();
                        break;
                    }
                    ConnectionEnd::SinkGone => {
                        conn.close();
                        return;
                    }
                    ConnectionEnd::Failed(reason) => reason,
                }
            }
            Err(e) => e.to_string(),
        };

        receiver.on_failure();
        warn!("Live: push channel closed ({}); attempt {} failed", reason, receiver.failures());
        if !sink(LiveEvent::Closed {
            deliberate: false,
            reason: Some(reason),
        }) {
            return;
        }

        let delay = receiver.next_delay(&mut rng);
        debug!("Live: reconnecting in {:?}", delay);
        if sleep_unless_closing(delay, closing) {
            break;
        }
    }

    receiver.close();
    debug!("Live: push channel closed deliberately");
    let _ = sink(LiveEvent::Closed {
        deliberate: true,
        reason: None,
    });
}

enum ConnectionEnd {
    Deliberate,
    SinkGone,
    Failed(String),
}

fn pump_connection<P, F>(conn: &mut P, receiver: &LiveUpdateReceiver, closing: &AtomicBool, sink: &mut F) -> ConnectionEnd
where
    P: PushConnection,
    F: FnMut(LiveEvent) -> bool,
{
    loop {
        if closing.load(Ordering::SeqCst) {
            return ConnectionEnd::Deliberate;
        }
        let text = match conn.read_frame() {
            Ok(Frame::Text(text)) => text,
            Ok(Frame::Idle) => continue,
            Ok(Frame::Undecodable(message)) => {
                let e = DecodeError {
                    context: "push frame".to_string(),
                    path: ".".to_string(),
                    message,
                };
                warn!("Live: dropping undecodable frame: {}", e);
                if !sink(LiveEvent::Rejected(SyncError::Decode(e))) {
                    return ConnectionEnd::SinkGone;
                }
                continue;
            }
            Ok(Frame::Closed) => return ConnectionEnd::Failed("closed by peer".to_string()),
            Err(e) => return ConnectionEnd::Failed(e.to_string()),
        };

        let decoded = match receiver.on_frame(&text) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Live: dropping undecodable frame: {}", e);
                if !sink(LiveEvent::Rejected(SyncError::Decode(e))) {
                    return ConnectionEnd::SinkGone;
                }
                continue;
            }
        };

        for e in decoded.rejected {
            warn!("Live: rejecting update: {}", e);
            if !sink(LiveEvent::Rejected(SyncError::Decode(e))) {
                return ConnectionEnd::SinkGone;
            }
        }
        if !decoded.updates.is_empty() && !sink(LiveEvent::Updates(decoded.updates)) {
            return ConnectionEnd::SinkGone;
        }
    }
}

/// Returns `true` if the sleep was cut short by a deliberate close.
fn sleep_unless_closing(total: Duration, closing: &AtomicBool) -> bool {
    // an unrepresentable deadline means waiting for the close flag only
    let deadline = Instant::now().checked_add(total);
    loop {
        if closing.load(Ordering::SeqCst) {
            return true;
        }
        let remaining = match deadline {
            Some(d) => d.saturating_duration_since(Instant::now()),
            None => CLOSE_CHECK_INTERVAL,
        };
        if remaining.is_zero() {
            return false;
        }
        thread::sleep(remaining.min(CLOSE_CHECK_INTERVAL));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channel::ChannelError;
    use crate::models::fermentation::BatchId;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::mpsc;

    /// In-memory transport: each `connect` pops the next scripted connection, or fails when the script
    /// is exhausted.
    pub(crate) struct ScriptedConnector {
        scripts: Mutex<VecDeque<Vec<Frame>>>,
        pub(crate) connects: Mutex<u32>,
    }

    impl ScriptedConnector {
        pub(crate) fn new(scripts: Vec<Vec<Frame>>) -> Self {
            ScriptedConnector {
                scripts: Mutex::new(scripts.into()),
                connects: Mutex::new(0),
            }
        }
    }

    pub(crate) struct ScriptedConnection {
        frames: VecDeque<Frame>,
    }

    impl PushConnection for ScriptedConnection {
        fn read_frame(&mut self) -> Result<Frame, ChannelError> {
            match self.frames.pop_front() {
                Some(frame) => Ok(frame),
                None => {
                    thread::sleep(Duration::from_millis(5));
                    Ok(Frame::Idle)
                }
            }
        }

        fn close(&mut self) {}
    }

    impl PushConnector for ScriptedConnector {
        type Connection = ScriptedConnection;

        fn connect(&self) -> Result<ScriptedConnection, ChannelError> {
            *self.connects.lock().unwrap() += 1;
            match self.scripts.lock().unwrap().pop_front() {
                Some(frames) => Ok(ScriptedConnection { frames: frames.into() }),
                None => Err(ChannelError::Connect("connection refused".into())),
            }
        }
    }

    pub(crate) fn fast_backoff() -> Backoff {
        Backoff {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(20),
            jitter: 0.0,
        }
    }

    fn recv(rx: &mpsc::Receiver<LiveEvent>) -> LiveEvent {
        rx.recv_timeout(Duration::from_secs(5)).expect("live event")
    }

    #[test]
    fn state_machine_transitions() {
        let mut r = LiveUpdateReceiver::new(Backoff::default());
        assert!(r.begin_connect());
        assert_eq!(r.state(), ChannelState::Connecting);
        r.on_open();
        assert_eq!(r.state(), ChannelState::Open);
        r.on_failure();
        assert_eq!(r.state(), ChannelState::Closed { deliberate: false });
        assert!(r.should_reconnect());
        assert!(r.begin_connect());

        r.close();
        r.on_failure();
        assert_eq!(r.state(), ChannelState::Closed { deliberate: true });
        assert!(!r.should_reconnect());
        assert!(!r.begin_connect());
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let b = Backoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.2,
        };
        let delays: Vec<u64> = (1..=7).map(|n| b.base_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(b.base_delay(u32::MAX), Duration::from_secs(30));

        let mut rng = SmallRng::seed_from_u64(7);
        for attempt in 1..10 {
            let d = b.delay(attempt, &mut rng);
            let base = b.base_delay(attempt);
            assert!(d >= base && d <= base.mul_f64(1.2));
        }
    }

    #[test]
    fn huge_bounds_saturate_instead_of_overflowing() {
        let b = Backoff {
            initial: Duration::MAX,
            max: Duration::MAX,
            jitter: 0.2,
        };
        let mut rng = SmallRng::seed_from_u64(3);
        assert_eq!(b.base_delay(4), Duration::MAX);
        assert_eq!(b.delay(4, &mut rng), Duration::MAX);
    }

    #[test]
    fn failures_reset_on_open() {
        let mut r = LiveUpdateReceiver::new(fast_backoff());
        r.begin_connect();
        r.on_failure();
        r.begin_connect();
        r.on_failure();
        assert_eq!(r.failures(), 2);
        assert_eq!(r.next_delay(&mut rand::rng()), Duration::from_millis(10));
        r.begin_connect();
        r.on_open();
        assert_eq!(r.failures(), 0);
    }

    #[test]
    fn decodes_update_frames() {
        let r = LiveUpdateReceiver::new(Backoff::default());
        let decoded = r
            .on_frame(r#"{"type":"update","data":[{"batch_id":1,"current_temp":19.0},{"current_temp":3},{"batch_id":2,"phase_progress":"lots"},{"batch_id":3}]}"#)
            .unwrap();
        let ids: Vec<BatchId> = decoded.updates.iter().map(|u| u.batch_id).collect();
        assert_eq!(ids, vec![BatchId(1), BatchId(3)]);
        assert_eq!(decoded.rejected.len(), 2);
        assert_eq!(decoded.rejected[1].path, "phase_progress");
    }

    #[test]
    fn bad_frames_are_errors_and_other_types_ignored() {
        let r = LiveUpdateReceiver::new(Backoff::default());
        assert!(r.on_frame("{not json").is_err());
        assert!(r.on_frame(r#"{"data":[]}"#).is_err());
        assert_eq!(r.on_frame(r#"{"type":"heartbeat"}"#).unwrap(), DecodedFrame::default());
    }

    #[test]
    fn driver_survives_bad_frames_and_reconnects_after_peer_close() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            vec![
                Frame::Text("garbage".into()),
                Frame::Undecodable("binary frame is not valid UTF-8".into()),
                Frame::Text(r#"{"type":"update","data":[{"batch_id":4,"current_temp":12.5}]}"#.into()),
                Frame::Closed,
            ],
            vec![],
        ]));
        let (tx, rx) = mpsc::channel();
        let handle = spawn_channel(Arc::clone(&connector), fast_backoff(), move |e| tx.send(e).is_ok()).unwrap();

        assert_eq!(recv(&rx), LiveEvent::Connecting);
        assert_eq!(recv(&rx), LiveEvent::Opened);
        assert!(matches!(recv(&rx), LiveEvent::Rejected(SyncError::Decode(_))));
        match recv(&rx) {
            LiveEvent::Rejected(SyncError::Decode(e)) => assert!(e.message.contains("UTF-8")),
            other => panic!("unexpected event {:?}", other),
        }
        match recv(&rx) {
            LiveEvent::Updates(updates) => {
                assert_eq!(updates.len(), 1);
                assert_eq!(updates[0].current_temp, Some(Some(12.5)));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(recv(&rx), LiveEvent::Closed { deliberate: false, .. }));
        assert_eq!(recv(&rx), LiveEvent::Connecting);
        assert_eq!(recv(&rx), LiveEvent::Opened);

        handle.join();
        assert_eq!(
            recv(&rx),
            LiveEvent::Closed {
                deliberate: true,
                reason: None
            }
        );
        assert_eq!(*connector.connects.lock().unwrap(), 2);
    }

    #[test]
    fn deliberate_close_stops_reconnecting() {
        let connector = Arc::new(ScriptedConnector::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        let handle = spawn_channel(Arc::clone(&connector), fast_backoff(), move |e| tx.send(e).is_ok()).unwrap();

        assert_eq!(recv(&rx), LiveEvent::Connecting);
        assert!(matches!(recv(&rx), LiveEvent::Closed { deliberate: false, .. }));
        // the retry is announced before it runs
        assert_eq!(recv(&rx), LiveEvent::Connecting);
        handle.join();

        let connects = *connector.connects.lock().unwrap();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(*connector.connects.lock().unwrap(), connects);
        let last = rx.try_iter().last();
        assert_eq!(
            last,
            Some(LiveEvent::Closed {
                deliberate: true,
                reason: None
            })
        );
    }
}
