use core::fmt::Write as _;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::OtaConfig;
use crate::firmware::{FirmwareDescriptor, TransferProgress};
use crate::types::{FwState, FwStatePayload};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("not enough space: image is {needed} bytes, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },
    #[error("flash begin failed: {0}")]
    Begin(String),
    #[error("flash write failed: {0}")]
    Write(String),
    #[error("image verification failed: {0}")]
    Finalize(String),
    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

/// Flash-session seam. One session at a time: every successful `begin`
/// is balanced by exactly one `finalize` or `abort`.
pub trait FirmwareWriter {
    /// Bytes available in the inactive firmware slot.
    fn free_space(&self) -> u64;
    fn begin(&mut self, total_size: u64) -> Result<(), OtaError>;
    fn write(&mut self, data: &[u8]) -> Result<(), OtaError>;
    fn finalize(&mut self) -> Result<(), OtaError>;
    fn abort(&mut self);
}

/// Side effects for the platform layer to run after the engine lock is
/// released. Publishing inside the lock would stall the network task
/// behind a slow tick (and vice versa).
#[derive(Debug, Clone, PartialEq)]
pub enum OtaAction {
    PublishState(FwStatePayload),
    RequestChunk {
        request_id: u32,
        index: u32,
        offset: u64,
        chunk_size: u32,
    },
    ScheduleRestart {
        delay_ms: u64,
    },
}

/// Read-only progress view for status surfaces.
#[derive(Debug, Clone, PartialEq)]
pub struct OtaStatusSnapshot {
    pub state: FwState,
    pub version: Option<String>,
    pub bytes_written: u64,
    pub total_bytes: Option<u64>,
    pub progress_pct: Option<u8>,
    pub last_error: Option<String>,
}

/// The update state machine. Fed announcements and chunk deliveries by the
/// message router and ticked by a dedicated task; owns the transfer
/// bookkeeping and the flash session exclusively.
pub struct OtaEngine<W: FirmwareWriter> {
    config: OtaConfig,
    writer: W,
    state: FwState,
    descriptor: Option<FirmwareDescriptor>,
    progress: TransferProgress,
    session_open: bool,
    awaiting_chunk: bool,
    request_id: u32,
    hasher: Sha256,
    last_error: Option<String>,
}

impl<W: FirmwareWriter> OtaEngine<W> {
    pub fn new(config: OtaConfig, writer: W) -> Self {
        Self {
            config,
            writer,
            state: FwState::Idle,
            descriptor: None,
            progress: TransferProgress::default(),
            session_open: false,
            awaiting_chunk: false,
            request_id: 0,
            hasher: Sha256::new(),
            last_error: None,
        }
    }

    pub fn state(&self) -> FwState {
        self.state
    }

    pub fn descriptor(&self) -> Option<&FirmwareDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn status(&self) -> OtaStatusSnapshot {
        let total = self.descriptor.as_ref().map(|d| d.size);
        let pct = total.filter(|t| *t > 0).map(|t| {
            (self.progress.offset.saturating_mul(100) / t).min(100) as u8
        });
        OtaStatusSnapshot {
            state: self.state,
            version: self.descriptor.as_ref().map(|d| d.version.clone()),
            bytes_written: self.progress.offset,
            total_bytes: total,
            progress_pct: pct,
            last_error: self.last_error.clone(),
        }
    }

    /// A firmware announcement replaces any prior attempt: the open session
    /// (if any) is aborted and the transfer restarts from offset zero. This
    /// is the coordinator's only way to un-stick or retry a device.
    pub fn announce(&mut self, descriptor: FirmwareDescriptor) -> Vec<OtaAction> {
        self.cancel_session();
        self.progress.reset();
        self.hasher = Sha256::new();
        self.request_id = self.request_id.wrapping_add(1);

        let available = self.writer.free_space();
        if descriptor.size > available {
            let err = OtaError::InsufficientSpace {
                needed: descriptor.size,
                available,
            };
            self.descriptor = Some(descriptor);
            return self.fail(err);
        }

        self.descriptor = Some(descriptor);
        self.state = FwState::Initiated;
        self.last_error = None;
        vec![OtaAction::PublishState(FwStatePayload::new(
            FwState::Initiated,
        ))]
    }

    /// Periodic driver: opens the flash session, schedules chunk requests,
    /// expires request timeouts, and finalizes a completed download.
    pub fn tick(&mut self, now_ms: u64) -> Vec<OtaAction> {
        match self.state {
            FwState::Initiated => self.open_session(now_ms),
            FwState::Downloading => self.drive_download(now_ms),
            FwState::Downloaded => self.finalize(),
            FwState::Idle | FwState::Updated | FwState::Failed => Vec::new(),
        }
    }

    /// A chunk delivery from the network task. `index` is present only for
    /// transports whose response topic carries it; deliveries that do not
    /// match the expected position are discarded before touching flash.
    pub fn chunk_received(&mut self, index: Option<u32>, data: &[u8]) -> Vec<OtaAction> {
        if self.state != FwState::Downloading || !self.session_open || !self.awaiting_chunk {
            return Vec::new();
        }
        if let Some(index) = index {
            if index != self.progress.chunks_received {
                return Vec::new();
            }
        }

        let Some(descriptor) = self.descriptor.as_ref() else {
            return Vec::new();
        };
        let total = descriptor.size;
        let len = data.len() as u64;

        // An empty or oversized delivery means the transfer desynchronized;
        // drop it and let the scheduler re-request the expected offset.
        if len == 0 || self.progress.offset + len > total {
            self.awaiting_chunk = false;
            self.progress.last_request_ms = None;
            return Vec::new();
        }

        if let Err(err) = self.writer.write(data) {
            self.writer.abort();
            self.session_open = false;
            return self.fail(err);
        }

        self.hasher.update(data);
        self.progress.offset += len;
        self.progress.chunks_received += 1;
        self.progress.timeouts = 0;
        self.awaiting_chunk = false;
        self.progress.last_request_ms = None;

        if self.progress.offset >= total {
            self.state = FwState::Downloaded;
            return vec![OtaAction::PublishState(FwStatePayload::new(
                FwState::Downloaded,
            ))];
        }

        Vec::new()
    }

    fn open_session(&mut self, now_ms: u64) -> Vec<OtaAction> {
        let Some(size) = self.descriptor.as_ref().map(|d| d.size) else {
            return Vec::new();
        };

        // Guarded for re-entrancy: a session left open by an interleaved
        // path is reused rather than double-begun.
        if !self.session_open {
            if let Err(err) = self.writer.begin(size) {
                return self.fail(err);
            }
            self.session_open = true;
        }

        self.state = FwState::Downloading;
        let mut actions = vec![OtaAction::PublishState(FwStatePayload::new(
            FwState::Downloading,
        ))];
        actions.extend(self.request_next_chunk(now_ms));
        actions
    }

    fn drive_download(&mut self, now_ms: u64) -> Vec<OtaAction> {
        let Some(total) = self.descriptor.as_ref().map(|d| d.size) else {
            return Vec::new();
        };

        if self.awaiting_chunk {
            let timed_out = self
                .progress
                .last_request_ms
                .is_some_and(|last| now_ms.saturating_sub(last) >= self.config.request_timeout_ms);
            if timed_out {
                // Clear the outstanding flag only; the next tick issues the
                // single re-request for this timeout period.
                self.awaiting_chunk = false;
                self.progress.last_request_ms = None;
                self.progress.timeouts += 1;
                if let Some(cap) = self.config.max_chunk_retries {
                    if self.progress.timeouts > cap {
                        self.cancel_session();
                        return self.fail_with("chunk request retries exhausted");
                    }
                }
            }
            return Vec::new();
        }

        if self.progress.offset < total {
            return self.request_next_chunk(now_ms);
        }

        Vec::new()
    }

    fn request_next_chunk(&mut self, now_ms: u64) -> Vec<OtaAction> {
        let Some(descriptor) = self.descriptor.as_ref() else {
            return Vec::new();
        };

        self.awaiting_chunk = true;
        self.progress.last_request_ms = Some(now_ms);
        vec![OtaAction::RequestChunk {
            request_id: self.request_id,
            index: self.progress.chunks_received,
            offset: self.progress.offset,
            chunk_size: descriptor.chunk_size,
        }]
    }

    fn finalize(&mut self) -> Vec<OtaAction> {
        let Some(descriptor) = self.descriptor.as_ref() else {
            return Vec::new();
        };

        // Only sha256 digests are checked here; announcements carrying a
        // different algorithm defer to the writer's own image validation.
        if descriptor.checksum_algorithm == "sha256" && !descriptor.checksum.is_empty() {
            let actual = hex_digest(self.hasher.clone());
            if actual != descriptor.checksum {
                let err = OtaError::ChecksumMismatch {
                    expected: descriptor.checksum.clone(),
                    actual,
                };
                self.cancel_session();
                return self.fail(err);
            }
        }

        self.session_open = false;
        if let Err(err) = self.writer.finalize() {
            return self.fail(err);
        }

        self.state = FwState::Updated;
        vec![
            OtaAction::PublishState(FwStatePayload::new(FwState::Updated)),
            OtaAction::ScheduleRestart {
                delay_ms: self.config.restart_delay_ms,
            },
        ]
    }

    fn cancel_session(&mut self) {
        if self.session_open {
            self.writer.abort();
            self.session_open = false;
        }
        self.awaiting_chunk = false;
    }

    fn fail(&mut self, err: OtaError) -> Vec<OtaAction> {
        self.fail_with(err.to_string())
    }

    fn fail_with(&mut self, reason: impl Into<String>) -> Vec<OtaAction> {
        let reason = reason.into();
        self.state = FwState::Failed;
        self.last_error = Some(reason.clone());
        self.awaiting_chunk = false;
        vec![OtaAction::PublishState(FwStatePayload::failed(reason))]
    }
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Default)]
    struct MockFlash {
        capacity: u64,
        begins: u32,
        finalizes: u32,
        aborts: u32,
        written: Vec<u8>,
        fail_begin: bool,
        fail_write: bool,
        fail_finalize: bool,
    }

    impl MockFlash {
        fn with_capacity(capacity: u64) -> Self {
            Self {
                capacity,
                ..Self::default()
            }
        }

        fn open_sessions(&self) -> u32 {
            self.begins - self.finalizes - self.aborts
        }
    }

    impl FirmwareWriter for MockFlash {
        fn free_space(&self) -> u64 {
            self.capacity
        }

        fn begin(&mut self, _total_size: u64) -> Result<(), OtaError> {
            if self.fail_begin {
                return Err(OtaError::Begin("no free slot".into()));
            }
            self.begins += 1;
            self.written.clear();
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> Result<(), OtaError> {
            if self.fail_write {
                return Err(OtaError::Write("short write".into()));
            }
            self.written.extend_from_slice(data);
            Ok(())
        }

        fn finalize(&mut self) -> Result<(), OtaError> {
            self.finalizes += 1;
            if self.fail_finalize {
                return Err(OtaError::Finalize("magic byte check failed".into()));
            }
            Ok(())
        }

        fn abort(&mut self) {
            self.aborts += 1;
        }
    }

    fn descriptor(size: u64, chunk_size: u32, checksum: &str) -> FirmwareDescriptor {
        FirmwareDescriptor {
            title: "sitemon".into(),
            version: "1.2.0".into(),
            size,
            chunk_size,
            checksum: checksum.into(),
            checksum_algorithm: "sha256".into(),
        }
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex_digest({
            let mut hasher = Sha256::new();
            hasher.update(data);
            hasher
        })
    }

    fn engine(capacity: u64) -> OtaEngine<MockFlash> {
        OtaEngine::new(OtaConfig::default(), MockFlash::with_capacity(capacity))
    }

    fn published_states(actions: &[OtaAction]) -> Vec<&str> {
        actions
            .iter()
            .filter_map(|action| match action {
                OtaAction::PublishState(payload) => Some(payload.fw_state),
                _ => None,
            })
            .collect()
    }

    fn requested(actions: &[OtaAction]) -> Option<(u32, u64)> {
        actions.iter().find_map(|action| match action {
            OtaAction::RequestChunk { index, offset, .. } => Some((*index, *offset)),
            _ => None,
        })
    }

    /// Runs a full transfer, delivering exact chunks on request, and
    /// returns the sequence of requested (index, offset) pairs.
    fn run_transfer(engine: &mut OtaEngine<MockFlash>, data: &[u8]) -> Vec<(u32, u64)> {
        let mut requests = Vec::new();
        let mut now_ms = 0;
        loop {
            now_ms += 500;
            let actions = engine.tick(now_ms);
            if let Some((index, offset)) = requested(&actions) {
                requests.push((index, offset));
                let chunk_size = engine.descriptor().unwrap().chunk_size as usize;
                let start = offset as usize;
                let end = (start + chunk_size).min(data.len());
                engine.chunk_received(Some(index), &data[start..end]);
            }
            if engine.state().is_terminal() {
                return requests;
            }
            assert!(requests.len() < 10_000, "transfer did not converge");
        }
    }

    #[test]
    fn end_to_end_update_succeeds() {
        let data = image(20_000);
        let mut engine = engine(1 << 20);

        let actions = engine.announce(descriptor(20_000, 8_192, &sha256_hex(&data)));
        assert_eq!(published_states(&actions), ["INITIATED"]);
        assert_eq!(engine.state(), FwState::Initiated);

        // First tick opens the session and requests chunk 0.
        let actions = engine.tick(500);
        assert_eq!(published_states(&actions), ["DOWNLOADING"]);
        assert_eq!(requested(&actions), Some((0, 0)));

        let actions = engine.chunk_received(Some(0), &data[..8_192]);
        assert!(actions.is_empty());
        assert_eq!(engine.progress().offset, 8_192);

        let actions = engine.tick(1_000);
        assert_eq!(requested(&actions), Some((1, 8_192)));
        engine.chunk_received(Some(1), &data[8_192..16_384]);

        let actions = engine.tick(1_500);
        assert_eq!(requested(&actions), Some((2, 16_384)));
        let actions = engine.chunk_received(Some(2), &data[16_384..]);
        assert_eq!(published_states(&actions), ["DOWNLOADED"]);
        assert_eq!(engine.progress().offset, 20_000);

        let actions = engine.tick(2_000);
        assert_eq!(published_states(&actions), ["UPDATED"]);
        assert!(actions
            .iter()
            .any(|a| matches!(a, OtaAction::ScheduleRestart { delay_ms: 2_000 })));

        let flash = engine.writer();
        assert_eq!(flash.begins, 1);
        assert_eq!(flash.finalizes, 1);
        assert_eq!(flash.aborts, 0);
        assert_eq!(flash.written, data);
    }

    #[test]
    fn requested_indices_are_gapless_for_varied_geometries() {
        for (size, chunk_size) in [(1_u64, 1_u32), (100, 7), (8_192, 8_192), (20_000, 8_192)] {
            let data = image(size as usize);
            let mut engine = engine(1 << 20);
            engine.announce(descriptor(size, chunk_size, &sha256_hex(&data)));

            let requests = run_transfer(&mut engine, &data);

            let expected_chunks = size.div_ceil(u64::from(chunk_size)) as u32;
            let expected: Vec<(u32, u64)> = (0..expected_chunks)
                .map(|i| (i, u64::from(i) * u64::from(chunk_size)))
                .collect();
            assert_eq!(requests, expected, "size={size} chunk={chunk_size}");
            assert_eq!(engine.state(), FwState::Updated);
        }
    }

    #[test]
    fn insufficient_space_fails_without_begin() {
        let mut engine = engine(10_000);
        let actions = engine.announce(descriptor(20_000, 8_192, "ab"));

        assert_eq!(engine.state(), FwState::Failed);
        assert_eq!(published_states(&actions), ["FAILED"]);
        let OtaAction::PublishState(payload) = &actions[0] else {
            panic!("expected a state publish");
        };
        assert!(payload.fw_error.as_deref().unwrap().contains("not enough space"));
        assert_eq!(engine.writer().begins, 0);

        // Ticks in FAILED stay inert until the next announcement.
        assert!(engine.tick(500).is_empty());
    }

    #[test]
    fn reannouncement_mid_download_aborts_and_restarts() {
        let data = image(20_000);
        let mut engine = engine(1 << 20);
        engine.announce(descriptor(20_000, 8_192, &sha256_hex(&data)));
        engine.tick(500);
        engine.chunk_received(Some(0), &data[..8_192]);
        assert_eq!(engine.progress().offset, 8_192);

        let new_data = image(12_000);
        let actions = engine.announce(descriptor(12_000, 4_096, &sha256_hex(&new_data)));
        assert_eq!(published_states(&actions), ["INITIATED"]);
        assert_eq!(engine.progress().offset, 0);
        assert_eq!(engine.writer().aborts, 1);

        let requests = run_transfer(&mut engine, &new_data);
        assert_eq!(requests[0], (0, 0));
        assert_eq!(engine.state(), FwState::Updated);

        let flash = engine.writer();
        assert_eq!(flash.begins, 2);
        assert_eq!(flash.open_sessions(), 0);
        assert_eq!(flash.written, new_data);
    }

    #[test]
    fn no_second_request_while_one_is_outstanding() {
        let data = image(20_000);
        let mut engine = engine(1 << 20);
        engine.announce(descriptor(20_000, 8_192, &sha256_hex(&data)));

        let actions = engine.tick(500);
        assert!(requested(&actions).is_some());

        // Repeated ticks inside the timeout window stay quiet.
        for now_ms in [1_000, 2_000, 3_000, 4_000, 5_000] {
            assert!(engine.tick(now_ms).is_empty());
        }
    }

    #[test]
    fn timeout_rerequests_once_per_period() {
        let data = image(20_000);
        let mut engine = engine(1 << 20);
        engine.announce(descriptor(20_000, 8_192, &sha256_hex(&data)));
        engine.tick(500); // request at t=500

        // Timeout expires at t=5500: the expiry tick only clears the flag.
        assert!(engine.tick(5_600).is_empty());
        // The following tick issues exactly one re-request for the same chunk.
        let actions = engine.tick(6_100);
        assert_eq!(requested(&actions), Some((0, 0)));
        // And again only after a full timeout period.
        assert!(engine.tick(6_600).is_empty());
        assert!(engine.tick(11_000).is_empty());
        assert!(engine.tick(11_200).is_empty());
        let actions = engine.tick(11_700);
        assert_eq!(requested(&actions), Some((0, 0)));
    }

    #[test]
    fn retry_cap_fails_the_attempt() {
        let data = image(20_000);
        let config = OtaConfig {
            max_chunk_retries: Some(2),
            ..OtaConfig::default()
        };
        let mut engine = OtaEngine::new(config, MockFlash::with_capacity(1 << 20));
        engine.announce(descriptor(20_000, 8_192, &sha256_hex(&data)));

        let mut now_ms = 500;
        engine.tick(now_ms);
        let mut failed = Vec::new();
        for _ in 0..6 {
            now_ms += 5_100; // expire
            failed.extend(engine.tick(now_ms));
            now_ms += 500; // re-request
            failed.extend(engine.tick(now_ms));
            if engine.state() == FwState::Failed {
                break;
            }
        }

        assert_eq!(engine.state(), FwState::Failed);
        assert_eq!(published_states(&failed), ["FAILED"]);
        assert_eq!(engine.writer().aborts, 1);
        assert_eq!(engine.writer().open_sessions(), 0);
    }

    #[test]
    fn unbounded_retry_keeps_rerequesting() {
        let data = image(20_000);
        let mut engine = engine(1 << 20);
        engine.announce(descriptor(20_000, 8_192, &sha256_hex(&data)));

        let mut now_ms = 500;
        engine.tick(now_ms);
        let mut rerequests = 0;
        for _ in 0..50 {
            now_ms += 5_100;
            engine.tick(now_ms);
            now_ms += 500;
            if requested(&engine.tick(now_ms)).is_some() {
                rerequests += 1;
            }
        }

        assert_eq!(rerequests, 50);
        assert_eq!(engine.state(), FwState::Downloading);
    }

    #[test]
    fn duplicate_delivery_is_discarded() {
        let data = image(20_000);
        let mut engine = engine(1 << 20);
        engine.announce(descriptor(20_000, 8_192, &sha256_hex(&data)));
        engine.tick(500);
        engine.chunk_received(Some(0), &data[..8_192]);

        // Same range delivered again with no request outstanding.
        let actions = engine.chunk_received(Some(0), &data[..8_192]);
        assert!(actions.is_empty());
        assert_eq!(engine.progress().offset, 8_192);
        assert_eq!(engine.progress().chunks_received, 1);
        assert_eq!(engine.writer().written.len(), 8_192);
    }

    #[test]
    fn stale_index_is_discarded_while_outstanding() {
        let data = image(20_000);
        let mut engine = engine(1 << 20);
        engine.announce(descriptor(20_000, 8_192, &sha256_hex(&data)));
        engine.tick(500);
        engine.chunk_received(Some(0), &data[..8_192]);
        engine.tick(1_000); // requests chunk 1

        let actions = engine.chunk_received(Some(0), &data[..8_192]);
        assert!(actions.is_empty());
        assert_eq!(engine.progress().offset, 8_192);

        // The real chunk 1 still lands.
        engine.chunk_received(Some(1), &data[8_192..16_384]);
        assert_eq!(engine.progress().offset, 16_384);
    }

    #[test]
    fn overflowing_delivery_is_dropped_and_rerequested() {
        let data = image(10_000);
        let mut engine = engine(1 << 20);
        engine.announce(descriptor(10_000, 8_192, &sha256_hex(&data)));
        engine.tick(500);
        engine.chunk_received(Some(0), &data[..8_192]);
        engine.tick(1_000);

        // 8192 more bytes would run past fw_size; must never reach flash.
        let oversized = image(8_192);
        let actions = engine.chunk_received(Some(1), &oversized);
        assert!(actions.is_empty());
        assert_eq!(engine.progress().offset, 8_192);
        assert_eq!(engine.writer().written.len(), 8_192);

        let actions = engine.tick(1_500);
        assert_eq!(requested(&actions), Some((1, 8_192)));
    }

    #[test]
    fn empty_delivery_is_dropped_and_rerequested() {
        let data = image(10_000);
        let mut engine = engine(1 << 20);
        engine.announce(descriptor(10_000, 8_192, &sha256_hex(&data)));
        engine.tick(500);

        assert!(engine.chunk_received(Some(0), &[]).is_empty());
        assert_eq!(engine.progress().offset, 0);
        assert_eq!(requested(&engine.tick(1_000)), Some((0, 0)));
    }

    #[test]
    fn chunk_after_failure_never_reopens_a_session() {
        let mut engine = engine(10);
        engine.announce(descriptor(20_000, 8_192, "ab"));
        assert_eq!(engine.state(), FwState::Failed);

        let late = image(8_192);
        assert!(engine.chunk_received(Some(0), &late).is_empty());
        assert!(engine.tick(500).is_empty());
        assert_eq!(engine.writer().begins, 0);
    }

    #[test]
    fn begin_failure_fails_the_attempt() {
        let mut flash = MockFlash::with_capacity(1 << 20);
        flash.fail_begin = true;
        let mut engine = OtaEngine::new(OtaConfig::default(), flash);
        engine.announce(descriptor(20_000, 8_192, "ab"));

        let actions = engine.tick(500);
        assert_eq!(published_states(&actions), ["FAILED"]);
        assert_eq!(engine.state(), FwState::Failed);
        assert_eq!(engine.writer().open_sessions(), 0);
    }

    #[test]
    fn write_failure_aborts_the_session() {
        let data = image(20_000);
        let mut flash = MockFlash::with_capacity(1 << 20);
        flash.fail_write = true;
        let mut engine = OtaEngine::new(OtaConfig::default(), flash);
        engine.announce(descriptor(20_000, 8_192, &sha256_hex(&data)));
        engine.tick(500);

        let actions = engine.chunk_received(Some(0), &data[..8_192]);
        assert_eq!(published_states(&actions), ["FAILED"]);
        assert_eq!(engine.state(), FwState::Failed);

        let flash = engine.writer();
        assert_eq!(flash.begins, 1);
        assert_eq!(flash.aborts, 1);
        assert_eq!(flash.finalizes, 0);
    }

    #[test]
    fn finalize_failure_reports_failed() {
        let data = image(8_000);
        let mut flash = MockFlash::with_capacity(1 << 20);
        flash.fail_finalize = true;
        let mut engine = OtaEngine::new(OtaConfig::default(), flash);
        engine.announce(descriptor(8_000, 8_192, &sha256_hex(&data)));
        engine.tick(500);
        let actions = engine.chunk_received(Some(0), &data);
        assert_eq!(published_states(&actions), ["DOWNLOADED"]);

        let actions = engine.tick(1_000);
        assert_eq!(published_states(&actions), ["FAILED"]);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, OtaAction::ScheduleRestart { .. })));

        let flash = engine.writer();
        assert_eq!(flash.finalizes, 1);
        assert_eq!(flash.aborts, 0);
        assert_eq!(flash.open_sessions(), 0);
    }

    #[test]
    fn checksum_mismatch_aborts_before_finalize() {
        let data = image(8_000);
        let mut engine = engine(1 << 20);
        engine.announce(descriptor(8_000, 8_192, &sha256_hex(b"something else")));
        engine.tick(500);
        engine.chunk_received(Some(0), &data);

        let actions = engine.tick(1_000);
        assert_eq!(published_states(&actions), ["FAILED"]);
        assert_eq!(engine.state(), FwState::Failed);

        let flash = engine.writer();
        assert_eq!(flash.finalizes, 0);
        assert_eq!(flash.aborts, 1);
        assert!(engine
            .status()
            .last_error
            .unwrap()
            .contains("checksum mismatch"));
    }

    #[test]
    fn downloaded_is_reached_exactly_once_with_short_final_chunk() {
        let data = image(12_000);
        let mut engine = engine(1 << 20);
        engine.announce(descriptor(12_000, 8_192, &sha256_hex(&data)));
        engine.tick(500);
        engine.chunk_received(Some(0), &data[..8_192]);
        engine.tick(1_000);

        let actions = engine.chunk_received(Some(1), &data[8_192..]);
        assert_eq!(published_states(&actions), ["DOWNLOADED"]);
        assert_eq!(engine.progress().offset, 12_000);

        // A stray re-delivery after completion changes nothing.
        assert!(engine.chunk_received(Some(1), &data[8_192..]).is_empty());
        assert_eq!(engine.progress().offset, 12_000);
    }

    #[test]
    fn status_snapshot_tracks_progress() {
        let data = image(20_000);
        let mut engine = engine(1 << 20);
        engine.announce(descriptor(20_000, 8_192, &sha256_hex(&data)));
        engine.tick(500);
        engine.chunk_received(Some(0), &data[..8_192]);

        let status = engine.status();
        assert_eq!(status.state, FwState::Downloading);
        assert_eq!(status.bytes_written, 8_192);
        assert_eq!(status.total_bytes, Some(20_000));
        assert_eq!(status.progress_pct, Some(40));
        assert_eq!(status.version.as_deref(), Some("1.2.0"));
        assert_eq!(status.last_error, None);
    }
}
