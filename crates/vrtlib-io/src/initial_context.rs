//! Initial context acquisition.
//!
//! VITA-49 does not promise that context arrives before data, yet a data
//! payload cannot be interpreted without its context. A reader therefore
//! holds packets back until it has seen the first data packet, the
//! context packet with the same stream ID, and every context stream that
//! context names in its association lists. The wait is bounded by a
//! deadline that starts with the first packet.
//!
//! [`ContextAcquirer`] is a pure state machine: callers pass in the
//! current time, which keeps it independent of the runtime and easy to
//! drive from tests.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use vrtlib_core::options::InitialTimeout;
use vrtlib_packet::{ContextFields, Packet};

use crate::listener::InitialContext;

/// Message attached when more context streams were seen than required.
pub const RULES_MESSAGE: &str = "context packets do not follow stream ID rules";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireState {
    AwaitingFirstPacket,
    AwaitingContext,
    Ready,
    /// Acquisition is disabled; packets go straight to raw delivery.
    LegacyBypass,
}

/// What the caller should do with a packet passed to
/// [`ContextAcquirer::accept`].
#[derive(Debug)]
pub enum Disposition {
    /// Held as part of the initial set; nothing to deliver yet.
    Absorbed,
    /// Acquisition just finished with this packet.
    Complete(InitialContext),
    /// Steady state: deliver through the per-type callbacks.
    Deliver,
    /// Legacy bypass: deliver through the raw packet callback.
    Raw,
}

#[derive(Debug)]
pub struct ContextAcquirer {
    state: AcquireState,
    timeout: InitialTimeout,
    deadline: Option<Instant>,
    paired_data: Option<Packet>,
    primary: Option<Packet>,
    required: BTreeSet<u32>,
    observed: HashMap<u32, Packet>,
    warnings: Vec<String>,
}

impl ContextAcquirer {
    pub fn new(timeout: InitialTimeout) -> Self {
        let state = match timeout {
            InitialTimeout::Legacy => AcquireState::LegacyBypass,
            _ => AcquireState::AwaitingFirstPacket,
        };
        Self {
            state,
            timeout,
            deadline: None,
            paired_data: None,
            primary: None,
            required: BTreeSet::new(),
            observed: HashMap::new(),
            warnings: Vec::new(),
        }
    }

    pub fn state(&self) -> AcquireState {
        self.state
    }

    /// When acquisition gives up, once the first packet has arrived.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Stream IDs that must be seen before acquisition completes.
    pub fn required(&self) -> impl Iterator<Item = u32> + '_ {
        self.required.iter().copied()
    }

    /// Diagnostics gathered since the last call.
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    /// Feed one received packet.
    pub fn accept(&mut self, packet: Packet, now: Instant) -> Disposition {
        match self.state {
            AcquireState::LegacyBypass => return Disposition::Raw,
            AcquireState::Ready => return Disposition::Deliver,
            AcquireState::AwaitingFirstPacket => {
                self.state = AcquireState::AwaitingContext;
                if let InitialTimeout::After(wait) = self.timeout {
                    // A deadline past the end of the clock never fires.
                    self.deadline = now.checked_add(wait);
                }
            }
            AcquireState::AwaitingContext => {}
        }

        if packet.is_data() {
            if self.paired_data.is_some() {
                tracing::trace!(
                    stream_id = ?packet.stream_id(),
                    "Dropping data packet received while awaiting context"
                );
                return Disposition::Absorbed;
            }
            let Some(id) = packet.stream_id() else {
                tracing::debug!("First data packet has no stream ID; skipping context acquisition");
                self.paired_data = Some(packet);
                return Disposition::Complete(self.finish(None));
            };
            self.required.insert(id);
            if let Some(ctx) = self.observed.get(&id) {
                self.primary = Some(ctx.clone());
            }
            self.paired_data = Some(packet);
        } else {
            self.absorb_context(packet);
        }

        match self.check_complete() {
            Some(ic) => Disposition::Complete(ic),
            None => Disposition::Absorbed,
        }
    }

    /// Give up if the deadline has passed.
    pub fn poll_timeout(&mut self, now: Instant) -> Option<InitialContext> {
        if self.state != AcquireState::AwaitingContext {
            return None;
        }
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }

        let message = match (&self.paired_data, &self.primary) {
            (Some(_), Some(_)) => {
                let missing: Vec<String> = self
                    .required
                    .iter()
                    .filter(|id| !self.observed.contains_key(id))
                    .map(|id| id.to_string())
                    .collect();
                format!(
                    "timed out after {:.1}s waiting for associated context streams {}",
                    self.wait().as_secs_f64(),
                    missing.join(", ")
                )
            }
            (Some(data), None) => match data.stream_id() {
                Some(id) => format!("no context stream found for data stream {id}"),
                None => "no context stream found".to_string(),
            },
            (None, _) => "no data stream found".to_string(),
        };
        tracing::warn!(message = %message, "Initial context acquisition timed out");
        Some(self.finish(Some(message)))
    }

    fn wait(&self) -> Duration {
        match self.timeout {
            InitialTimeout::After(wait) => wait,
            _ => Duration::ZERO,
        }
    }

    fn absorb_context(&mut self, packet: Packet) {
        let Some(id) = packet.stream_id() else {
            return;
        };
        match ContextFields::parse(&packet) {
            Ok(fields) => self.required.extend(fields.required_stream_ids()),
            Err(e) => self
                .warnings
                .push(format!("undecodable context packet for stream {id}: {e}")),
        }
        if self.paired_stream_id() == Some(id) {
            self.primary = Some(packet.clone());
        }
        self.observed.insert(id, packet);
    }

    fn paired_stream_id(&self) -> Option<u32> {
        self.paired_data.as_ref().and_then(Packet::stream_id)
    }

    fn check_complete(&mut self) -> Option<InitialContext> {
        self.primary.as_ref()?;
        if !self.required.iter().all(|id| self.observed.contains_key(id)) {
            return None;
        }
        let message = if self.observed.len() != self.required.len() {
            let extra: Vec<String> = self
                .observed
                .keys()
                .filter(|id| !self.required.contains(id))
                .map(|id| id.to_string())
                .collect();
            let message = format!("{RULES_MESSAGE} (unexpected streams {})", extra.join(", "));
            self.warnings.push(message.clone());
            Some(message)
        } else {
            None
        };
        Some(self.finish(message))
    }

    fn finish(&mut self, error_message: Option<String>) -> InitialContext {
        self.state = AcquireState::Ready;
        self.deadline = None;
        InitialContext {
            error_message,
            paired_data: self.paired_data.take(),
            primary_context: self.primary.take(),
            all_context: std::mem::take(&mut self.observed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vrtlib_packet::{ContextBuilder, PacketBuilder, PacketType};

    fn data(id: u32) -> Packet {
        PacketBuilder::data(id).payload(&[0; 8]).build().unwrap()
    }

    fn context(id: u32) -> Packet {
        ContextBuilder::new(id).sample_rate(1e6).build().unwrap()
    }

    fn context_with_sources(id: u32, sources: &[u32]) -> Packet {
        ContextBuilder::new(id)
            .sample_rate(1e6)
            .sources(sources)
            .build()
            .unwrap()
    }

    fn acquirer() -> ContextAcquirer {
        ContextAcquirer::new(InitialTimeout::After(Duration::from_secs(5)))
    }

    fn complete(d: Disposition) -> InitialContext {
        match d {
            Disposition::Complete(ic) => ic,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn data_then_context_completes() {
        let now = Instant::now();
        let mut acq = acquirer();
        assert!(matches!(acq.accept(data(100), now), Disposition::Absorbed));
        assert_eq!(acq.state(), AcquireState::AwaitingContext);

        let ctx = context(100);
        let ic = complete(acq.accept(ctx.clone(), now));
        assert!(ic.error_message.is_none());
        assert_eq!(ic.paired_data.unwrap().stream_id(), Some(100));
        assert_eq!(ic.primary_context, Some(ctx.clone()));
        assert_eq!(ic.all_context.len(), 1);
        assert_eq!(ic.all_context.get(&100), Some(&ctx));
        assert_eq!(acq.state(), AcquireState::Ready);

        assert!(matches!(acq.accept(data(100), now), Disposition::Deliver));
        assert!(matches!(acq.accept(context(100), now), Disposition::Deliver));
    }

    #[test]
    fn context_then_data_completes_identically() {
        let now = Instant::now();
        let mut acq = acquirer();
        let ctx = context(100);
        assert!(matches!(acq.accept(ctx.clone(), now), Disposition::Absorbed));
        let ic = complete(acq.accept(data(100), now));
        assert!(ic.error_message.is_none());
        assert_eq!(ic.primary_context, Some(ctx.clone()));
        assert_eq!(ic.all_context.len(), 1);
        assert_eq!(ic.all_context.get(&100), Some(&ctx));
        assert_eq!(acq.state(), AcquireState::Ready);
    }

    #[test]
    fn waits_for_associated_sources() {
        let now = Instant::now();
        let mut acq = acquirer();
        acq.accept(data(100), now);
        assert!(matches!(
            acq.accept(context_with_sources(100, &[200, 300]), now),
            Disposition::Absorbed
        ));
        assert_eq!(acq.required().collect::<Vec<_>>(), vec![100, 200, 300]);
        assert!(matches!(acq.accept(context(300), now), Disposition::Absorbed));
        let ic = complete(acq.accept(context(200), now));
        assert!(ic.error_message.is_none());
        assert_eq!(ic.all_context.len(), 3);
    }

    #[test]
    fn context_after_completion_is_steady_state() {
        let now = Instant::now();
        let mut acq = acquirer();
        acq.accept(data(100), now);
        acq.accept(context_with_sources(100, &[200]), now);
        let first = ContextBuilder::new(200).bandwidth(1e3).build().unwrap();
        let second = ContextBuilder::new(200).bandwidth(2e3).build().unwrap();
        acq.accept(first, now);
        // Completed on `first`; `second` is steady-state.
        assert!(matches!(acq.accept(second, now), Disposition::Deliver));
    }

    #[test]
    fn extra_context_stream_still_completes_with_rules_message() {
        let now = Instant::now();
        let mut acq = acquirer();
        acq.accept(context(999), now);
        acq.accept(data(100), now);
        let ic = complete(acq.accept(context(100), now));
        let msg = ic.error_message.unwrap();
        assert!(msg.starts_with(RULES_MESSAGE), "{msg}");
        assert!(msg.contains("999"));
        assert_eq!(ic.all_context.len(), 2);
        assert_eq!(acq.take_warnings().len(), 1);
    }

    #[test]
    fn unidentified_data_stream_skips_acquisition() {
        let now = Instant::now();
        let mut acq = acquirer();
        let bare = PacketBuilder::new(PacketType::Data)
            .payload(&[0; 4])
            .build()
            .unwrap();
        let ic = complete(acq.accept(bare, now));
        assert!(ic.error_message.is_none());
        assert!(ic.primary_context.is_none());
        assert!(ic.all_context.is_empty());
        assert!(matches!(acq.accept(data(1), now), Disposition::Deliver));
    }

    #[test]
    fn timeout_without_context() {
        let start = Instant::now();
        let mut acq = acquirer();
        acq.accept(data(100), start);
        assert_eq!(acq.deadline(), Some(start + Duration::from_secs(5)));

        assert!(acq.poll_timeout(start + Duration::from_secs(4)).is_none());
        let ic = acq.poll_timeout(start + Duration::from_secs(5)).unwrap();
        assert!(ic.error_message.unwrap().contains("no context stream"));
        assert_eq!(ic.paired_data.unwrap().stream_id(), Some(100));
        assert_eq!(acq.state(), AcquireState::Ready);

        // Does not re-enter the search.
        assert!(acq.poll_timeout(start + Duration::from_secs(60)).is_none());
        assert!(matches!(acq.accept(data(100), start), Disposition::Deliver));
    }

    #[test]
    fn timeout_without_data() {
        let start = Instant::now();
        let mut acq = acquirer();
        acq.accept(context(100), start);
        let ic = acq.poll_timeout(start + Duration::from_secs(6)).unwrap();
        assert_eq!(ic.error_message.as_deref(), Some("no data stream found"));
        assert_eq!(ic.all_context.len(), 1);
    }

    #[test]
    fn timeout_with_primary_names_missing_streams() {
        let start = Instant::now();
        let mut acq = acquirer();
        acq.accept(data(100), start);
        acq.accept(context_with_sources(100, &[200]), start);
        let ic = acq.poll_timeout(start + Duration::from_secs(5)).unwrap();
        let msg = ic.error_message.unwrap();
        assert!(msg.contains("200"), "{msg}");
        assert!(ic.primary_context.is_some());
    }

    #[test]
    fn deadline_starts_at_first_packet() {
        let mut acq = acquirer();
        assert!(acq.deadline().is_none());
        assert!(acq.poll_timeout(Instant::now() + Duration::from_secs(3600)).is_none());
        assert_eq!(acq.state(), AcquireState::AwaitingFirstPacket);
    }

    #[test]
    fn deadline_beyond_the_clock_waits_forever() {
        let start = Instant::now();
        let mut acq = ContextAcquirer::new(InitialTimeout::from_seconds(1e19).unwrap());
        assert!(matches!(acq.accept(data(100), start), Disposition::Absorbed));
        assert_eq!(acq.deadline(), None);
        assert!(acq.poll_timeout(start + Duration::from_secs(86_400)).is_none());
        assert!(matches!(acq.accept(context(100), start), Disposition::Complete(_)));
    }

    #[test]
    fn unlimited_never_times_out() {
        let start = Instant::now();
        let mut acq = ContextAcquirer::new(InitialTimeout::Unlimited);
        acq.accept(data(100), start);
        assert!(acq.deadline().is_none());
        assert!(acq.poll_timeout(start + Duration::from_secs(86_400)).is_none());
    }

    #[test]
    fn legacy_bypass_delivers_raw() {
        let mut acq = ContextAcquirer::new(InitialTimeout::Legacy);
        assert_eq!(acq.state(), AcquireState::LegacyBypass);
        assert!(matches!(acq.accept(data(1), Instant::now()), Disposition::Raw));
        assert!(matches!(acq.accept(context(1), Instant::now()), Disposition::Raw));
    }
}
