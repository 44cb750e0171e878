//! Event poller: crawls a contract's `Deposit`/`Withdrawal` log stream over
//! JSON-RPC, in fixed-width windows, and dispatches decoded events to
//! registered handlers through an async sink [`TaskQueue`] so the poll loop
//! itself is never blocked by handler latency.
//!
//! Grounded on the source `EventPoller` (see `original_source/Blockchain.py`):
//! same retry-until-positive-head loop, same 1000-block window split, same
//! "sleep remainder of the tick" pacing. The source's `web3.py` + threading
//! primitives are replaced here by a small [`rpc::RpcClient`] trait and the
//! `Mutex`/`Condvar` pattern already used by [`mixer_queue::TaskQueue`].

pub mod rpc;

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use mixer_queue::{Job, TaskQueue};
use mixer_types::{DepositEvent, LogEvent, WithdrawalEvent};
use primitive_types::U256;
use rpc::{RawLog, RpcClient};

/// Max block span of a single `eth_getLogs` window.
pub const WINDOW_SIZE: u64 = 1000;

pub fn deposit_topic() -> [u8; 32] {
    mixer_crypto::event_topic("Deposit(bytes32,uint32,uint256)")
}

pub fn withdrawal_topic() -> [u8; 32] {
    mixer_crypto::event_topic("Withdrawal(address,bytes32,address,uint256)")
}

pub type EventHandler = Arc<dyn Fn(LogEvent) + Send + Sync>;
pub type BlockHandler = Arc<dyn Fn(u64) + Send + Sync>;

/// Poller timing knobs. Plain [`Duration`]s rather than a bare float, so a
/// call site can never confuse seconds with milliseconds.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    pub rpc_retry_interval: Duration,
    pub rpc_query_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            rpc_retry_interval: Duration::from_secs(5),
            rpc_query_interval: Duration::from_millis(200),
        }
    }
}

struct PollerState {
    off: bool,
    synced: bool,
    cursor: u64,
    contract: String,
    topics: Vec<[u8; 32]>,
    event_handlers: Vec<EventHandler>,
    block_handlers: Vec<BlockHandler>,
}

/// Crawls `contract`'s log stream from a configurable start block, dispatching
/// decoded `Deposit`/`Withdrawal` events and per-window block progress to
/// registered handlers.
pub struct EventPoller {
    client: Arc<dyn RpcClient>,
    config: PollerConfig,
    sink: Arc<TaskQueue>,
    state: Arc<Mutex<PollerState>>,
    cond: Arc<Condvar>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventPoller {
    pub fn new(client: Arc<dyn RpcClient>, config: PollerConfig, sink: Arc<TaskQueue>) -> Self {
        Self {
            client,
            config,
            sink,
            state: Arc::new(Mutex::new(PollerState {
                off: true,
                synced: false,
                cursor: 0,
                contract: String::new(),
                topics: Vec::new(),
                event_handlers: Vec::new(),
                block_handlers: Vec::new(),
            })),
            cond: Arc::new(Condvar::new()),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the poll loop. `false` (with a warning logged) if already
    /// running — mirrors the source's re-`start`-while-running guard.
    pub fn start(&self, contract: &str, start_block: u64, topics: Vec<[u8; 32]>) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if !state.off {
                warn!(target: "mixer_chain", "start() already started");
                return false;
            }
            state.off = false;
            state.synced = false;
            state.cursor = start_block;
            state.contract = contract.to_string();
            state.topics = topics;
        }

        let client = self.client.clone();
        let config = self.config.clone();
        let sink = self.sink.clone();
        let state = self.state.clone();
        let cond = self.cond.clone();
        let handle = thread::Builder::new()
            .name("event-poller".to_string())
            .spawn(move || poll_loop(client, config, sink, state, cond))
            .expect("failed to spawn EventPoller worker thread");

        *self.worker.lock().unwrap() = Some(handle);
        debug!(target: "mixer_chain", "start() done");
        true
    }

    /// Signal shutdown and join the worker. In-flight RPC calls complete
    /// naturally; their results are discarded once `off` is observed.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.off {
                warn!(target: "mixer_chain", "stop() already stopped");
                return;
            }
            state.off = true;
        }
        self.cond.notify_all();

        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.join().expect("EventPoller worker thread panicked");
        }
        debug!(target: "mixer_chain", "stop() done");
    }

    pub fn add_event_handler(&self, handler: impl Fn(LogEvent) + Send + Sync + 'static) {
        self.state.lock().unwrap().event_handlers.push(Arc::new(handler));
    }

    pub fn add_block_handler(&self, handler: impl Fn(u64) + Send + Sync + 'static) {
        self.state.lock().unwrap().block_handlers.push(Arc::new(handler));
    }

    /// Wake the worker and block until it reports `synced == true`.
    pub fn catchup(&self) {
        self.cond.notify_all();
        loop {
            if self.state.lock().unwrap().synced {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
    }

    pub fn synced(&self) -> bool {
        self.state.lock().unwrap().synced
    }

    pub fn cursor(&self) -> u64 {
        self.state.lock().unwrap().cursor
    }
}

impl Drop for EventPoller {
    fn drop(&mut self) {
        if !self.state.lock().unwrap().off {
            self.stop();
        }
    }
}

/// Inclusive `[a, b]` windows of width `<= WINDOW_SIZE` covering `[cursor, head]`.
/// `head == cursor` yields the single window `[cursor, cursor]`.
pub fn build_windows(cursor: u64, head: u64) -> Vec<(u64, u64)> {
    if head == cursor {
        return vec![(cursor, cursor)];
    }
    let mut windows = Vec::new();
    let mut a = cursor;
    while a < head {
        let b = (a + WINDOW_SIZE).min(head);
        windows.push((a, b));
        a = b + 1;
    }
    windows
}

/// Decode a raw log by its first topic. `None` (with a warning logged) for
/// an unrecognized topic or truncated `data`.
pub fn decode_log(log: &RawLog) -> Option<LogEvent> {
    let sig = log.topics.first()?;
    let sig_bytes = mixer_types::hex_to_bytes_32(sig).ok()?;

    if sig_bytes == deposit_topic() {
        decode_deposit(log).map(LogEvent::Deposit)
    } else if sig_bytes == withdrawal_topic() {
        decode_withdrawal(log).map(LogEvent::Withdrawal)
    } else {
        warn!(target: "mixer_chain", topic = %sig, "unknown event topic, skipping");
        None
    }
}

fn decode_deposit(log: &RawLog) -> Option<DepositEvent> {
    if log.data.len() < 64 || log.topics.len() < 2 {
        warn!(target: "mixer_chain", "truncated Deposit log, skipping");
        return None;
    }
    let timestamp = be_u64(&log.data[0..32]);
    let leaf_index = be_u32(&log.data[32..64]);
    let commitment = mixer_types::normalize_hex(&log.topics[1]);
    Some(DepositEvent {
        timestamp,
        block_number: log.block_number,
        tx_hash: mixer_types::normalize_hex(&log.transaction_hash),
        commitment,
        leaf_index,
    })
}

fn decode_withdrawal(log: &RawLog) -> Option<WithdrawalEvent> {
    if log.data.len() < 96 {
        warn!(target: "mixer_chain", "truncated Withdrawal log, skipping");
        return None;
    }
    let to = mixer_types::bytes_to_hex(&log.data[12..32]);
    let nullifier_hash = mixer_types::bytes_to_hex(&log.data[32..64]);
    let fee = U256::from_big_endian(&log.data[64..96]);
    Some(WithdrawalEvent {
        block_number: log.block_number,
        tx_hash: mixer_types::normalize_hex(&log.transaction_hash),
        nullifier_hash,
        to,
        fee,
    })
}

fn be_u64(word: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = word.len().min(8);
    buf[8 - n..].copy_from_slice(&word[word.len() - n..]);
    u64::from_be_bytes(buf)
}

fn be_u32(word: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    let n = word.len().min(4);
    buf[4 - n..].copy_from_slice(&word[word.len() - n..]);
    u32::from_be_bytes(buf)
}

/// Block until `off` is set or `dur` elapses. Returns `false` if the poller
/// was asked to shut down while waiting (or already had been).
fn cancellable_wait(state: &Mutex<PollerState>, cond: &Condvar, dur: Duration) -> bool {
    let guard = state.lock().unwrap();
    if guard.off {
        return false;
    }
    let (guard, _) = cond.wait_timeout(guard, dur).unwrap();
    !guard.off
}

fn is_off(state: &Mutex<PollerState>) -> bool {
    state.lock().unwrap().off
}

fn set_synced(state: &Mutex<PollerState>, value: bool) {
    state.lock().unwrap().synced = value;
}

fn dispatch_event(sink: &TaskQueue, state: &Mutex<PollerState>, event: LogEvent) {
    let name = match &event {
        LogEvent::Deposit(_) => "EventDeposit",
        LogEvent::Withdrawal(_) => "EventWithdrawal",
    };
    let handlers: Vec<EventHandler> = state.lock().unwrap().event_handlers.clone();
    // Each handler gets its own clone of `event` and its own `Arc` handle,
    // so the job closure owns everything it touches by value.
    for handler in handlers {
        let event = event.clone();
        sink.run_async(Job::new(name, move || handler(event)));
    }
}

fn dispatch_block(sink: &TaskQueue, state: &Mutex<PollerState>, head: u64) {
    let handlers: Vec<BlockHandler> = state.lock().unwrap().block_handlers.clone();
    for handler in handlers {
        sink.run_async(Job::new("Progress", move || handler(head)));
    }
}

fn poll_loop(
    client: Arc<dyn RpcClient>,
    config: PollerConfig,
    sink: Arc<TaskQueue>,
    state: Arc<Mutex<PollerState>>,
    cond: Arc<Condvar>,
) {
    let mut tick_deadline = Instant::now();

    'outer: loop {
        if is_off(&state) {
            break;
        }

        let head = match get_head_with_retry(&client, &config, &state, &cond) {
            Some(h) => h,
            None => break, // shutdown signaled while waiting on a retry
        };

        let cursor = state.lock().unwrap().cursor;
        if head < cursor {
            set_synced(&state, true);
            if !cancellable_wait(&state, &cond, config.poll_interval) {
                break;
            }
            continue;
        }
        set_synced(&state, false);

        let (contract, topics) = {
            let guard = state.lock().unwrap();
            (guard.contract.clone(), guard.topics.clone())
        };

        let windows = build_windows(cursor, head);
        let mut deposits = 0usize;
        let mut withdrawals = 0usize;

        for (a, b) in &windows {
            let logs = match get_logs_with_retry(&client, &config, &state, &cond, &contract, *a, *b, &topics) {
                Some(l) => l,
                None => break 'outer,
            };

            for log in &logs {
                match decode_log(log) {
                    Some(event @ LogEvent::Deposit(_)) => {
                        deposits += 1;
                        dispatch_event(&sink, &state, event);
                    }
                    Some(event @ LogEvent::Withdrawal(_)) => {
                        withdrawals += 1;
                        dispatch_event(&sink, &state, event);
                    }
                    None => {}
                }
            }

            if !cancellable_wait(&state, &cond, config.rpc_query_interval) {
                break 'outer;
            }
        }

        info!(
            target: "mixer_chain",
            blocks = head - cursor + 1,
            deposits,
            withdrawals,
            "poll window complete"
        );

        dispatch_block(&sink, &state, head);
        state.lock().unwrap().cursor = head + 1;

        tick_deadline += config.poll_interval;
        let now = Instant::now();
        if tick_deadline > now {
            set_synced(&state, true);
            let remainder = tick_deadline - now;
            if !cancellable_wait(&state, &cond, remainder) {
                break;
            }
            set_synced(&state, false);
        }
    }

    set_synced(&state, false);
}

fn get_head_with_retry(
    client: &Arc<dyn RpcClient>,
    config: &PollerConfig,
    state: &Mutex<PollerState>,
    cond: &Condvar,
) -> Option<u64> {
    loop {
        if is_off(state) {
            return None;
        }
        match client.block_number() {
            Ok(n) if n > 0 => return Some(n),
            Ok(_) => {
                warn!(target: "mixer_chain", "eth_blockNumber returned non-positive, retrying");
            }
            Err(e) => {
                error!(target: "mixer_chain", error = %e, "eth_blockNumber failed, retrying");
            }
        }
        if !cancellable_wait(state, cond, config.rpc_retry_interval) {
            return None;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn get_logs_with_retry(
    client: &Arc<dyn RpcClient>,
    config: &PollerConfig,
    state: &Mutex<PollerState>,
    cond: &Condvar,
    contract: &str,
    from_block: u64,
    to_block: u64,
    topics: &[[u8; 32]],
) -> Option<Vec<RawLog>> {
    loop {
        if is_off(state) {
            return None;
        }
        match client.get_logs(contract, from_block, to_block, topics) {
            Ok(logs) => return Some(logs),
            Err(e) => {
                error!(target: "mixer_chain", error = %e, from_block, to_block, "eth_getLogs failed, retrying");
            }
        }
        if !cancellable_wait(state, cond, config.rpc_retry_interval) {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeClient {
        head_calls: AtomicUsize,
        /// Number of leading `block_number` calls that return a transient
        /// error before the real `heads` sequence starts, used to exercise
        /// the retry branch of `get_head_with_retry`.
        head_failures_remaining: AtomicUsize,
        heads: Vec<u64>,
        logs_by_window: StdMutex<std::collections::HashMap<(u64, u64), Vec<RawLog>>>,
    }

    impl RpcClient for FakeClient {
        fn block_number(&self) -> mixer_types::Result<u64> {
            // `fetch_update` succeeds (Ok) only while a failure budget remains
            // and consumes one unit of it; that call is the injected failure.
            // Once the budget is exhausted it returns Err and falls through
            // to the real `heads` sequence below.
            let consumed_a_failure = self
                .head_failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if consumed_a_failure {
                return Err(mixer_types::MixerError::Rpc("injected transient failure".into()));
            }
            let i = self.head_calls.fetch_add(1, Ordering::SeqCst);
            Ok(*self.heads.get(i.min(self.heads.len() - 1)).unwrap())
        }

        fn get_logs(
            &self,
            _address: &str,
            from_block: u64,
            to_block: u64,
            _topics: &[[u8; 32]],
        ) -> mixer_types::Result<Vec<RawLog>> {
            Ok(self
                .logs_by_window
                .lock()
                .unwrap()
                .remove(&(from_block, to_block))
                .unwrap_or_default())
        }
    }

    #[test]
    fn s5_poller_chunking_three_windows() {
        assert_eq!(
            build_windows(0, 2500),
            vec![(0, 1000), (1001, 2001), (2002, 2500)]
        );
    }

    #[test]
    fn s5_poller_chunking_single_window() {
        assert_eq!(build_windows(0, 500), vec![(0, 500)]);
    }

    #[test]
    fn s5_poller_chunking_equal_bounds() {
        assert_eq!(build_windows(10, 10), vec![(10, 10)]);
    }

    #[test]
    fn decode_deposit_roundtrip() {
        let mut data = vec![0u8; 64];
        data[24..32].copy_from_slice(&1_700_000_000u64.to_be_bytes());
        data[60..64].copy_from_slice(&7u32.to_be_bytes());
        let log = RawLog {
            block_number: 123,
            transaction_hash: "0xaa".repeat(1)[..4].to_string() + &"a".repeat(60),
            topics: vec![
                mixer_types::bytes_to_hex(&deposit_topic()),
                format!("0x{}", "01".repeat(32)),
            ],
            data,
        };
        let decoded = decode_log(&log).unwrap();
        match decoded {
            LogEvent::Deposit(d) => {
                assert_eq!(d.timestamp, 1_700_000_000);
                assert_eq!(d.leaf_index, 7);
                assert_eq!(d.block_number, 123);
            }
            _ => panic!("expected Deposit"),
        }
    }

    #[test]
    fn decode_withdrawal_roundtrip() {
        let mut data = vec![0u8; 96];
        data[12..32].copy_from_slice(&[0xab; 20]);
        data[32..64].copy_from_slice(&[0xcd; 32]);
        data[88..96].copy_from_slice(&500u64.to_be_bytes());
        let log = RawLog {
            block_number: 200,
            transaction_hash: "0xbb".to_string(),
            topics: vec![mixer_types::bytes_to_hex(&withdrawal_topic())],
            data,
        };
        let decoded = decode_log(&log).unwrap();
        match decoded {
            LogEvent::Withdrawal(w) => {
                assert_eq!(w.fee, U256::from(500));
                assert_eq!(w.to, mixer_types::bytes_to_hex(&[0xab; 20]));
                assert_eq!(w.block_number, 200);
            }
            _ => panic!("expected Withdrawal"),
        }
    }

    #[test]
    fn decode_withdrawal_fee_above_u128_is_not_truncated() {
        let mut data = vec![0u8; 96];
        data[64] = 0x01; // high byte of the fee word, well above 2^128
        let log = RawLog {
            block_number: 1,
            transaction_hash: "0xbb".to_string(),
            topics: vec![mixer_types::bytes_to_hex(&withdrawal_topic())],
            data,
        };
        let decoded = decode_log(&log).unwrap();
        match decoded {
            LogEvent::Withdrawal(w) => {
                assert_eq!(w.fee, U256::from(1u8) << 248);
            }
            _ => panic!("expected Withdrawal"),
        }
    }

    #[test]
    fn decode_log_unknown_topic_returns_none() {
        let log = RawLog {
            block_number: 1,
            transaction_hash: "0x00".to_string(),
            topics: vec![format!("0x{}", "ff".repeat(32))],
            data: vec![],
        };
        assert!(decode_log(&log).is_none());
    }

    #[test]
    fn decode_log_truncated_data_returns_none() {
        let log = RawLog {
            block_number: 1,
            transaction_hash: "0x00".to_string(),
            topics: vec![
                mixer_types::bytes_to_hex(&deposit_topic()),
                format!("0x{}", "01".repeat(32)),
            ],
            data: vec![0u8; 10],
        };
        assert!(decode_log(&log).is_none());
    }

    #[test]
    fn s6_retry_then_success_advances_cursor() {
        let client: Arc<dyn RpcClient> = Arc::new(FakeClient {
            head_calls: AtomicUsize::new(0),
            // One injected `eth_blockNumber` failure: exercises the retry
            // branch of `get_head_with_retry` before it succeeds with `10`.
            head_failures_remaining: AtomicUsize::new(1),
            heads: vec![10, 10],
            logs_by_window: StdMutex::new(std::collections::HashMap::new()),
        });
        let sink = Arc::new(TaskQueue::new("sink-test"));
        sink.start();
        let poller = EventPoller::new(
            client,
            PollerConfig {
                poll_interval: Duration::from_millis(20),
                rpc_retry_interval: Duration::from_millis(5),
                rpc_query_interval: Duration::from_millis(1),
            },
            sink.clone(),
        );

        let progressed = Arc::new(StdMutex::new(None));
        let p = progressed.clone();
        poller.add_block_handler(move |head| {
            *p.lock().unwrap() = Some(head);
        });

        assert!(poller.start("0xcontract", 0, vec![deposit_topic(), withdrawal_topic()]));
        poller.catchup();
        poller.stop();
        sink.stop();

        assert_eq!(poller.cursor(), 11);
        assert_eq!(*progressed.lock().unwrap(), Some(10));
    }

    #[test]
    fn restart_while_running_fails() {
        let client: Arc<dyn RpcClient> = Arc::new(FakeClient {
            head_calls: AtomicUsize::new(0),
            head_failures_remaining: AtomicUsize::new(0),
            heads: vec![0],
            logs_by_window: StdMutex::new(std::collections::HashMap::new()),
        });
        let sink = Arc::new(TaskQueue::new("sink-test-2"));
        sink.start();
        let poller = EventPoller::new(client, PollerConfig::default(), sink.clone());

        assert!(poller.start("0xcontract", 0, vec![]));
        assert!(!poller.start("0xcontract", 0, vec![]));
        poller.stop();
        sink.stop();
    }
}
