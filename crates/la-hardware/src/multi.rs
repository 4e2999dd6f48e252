//! Multi-device synchronized capture.
//!
//! [`MultiAnalyzerDriver`] fuses 2 to 5 physical analyzers into one logical
//! instrument. Member 0 is the trigger master; every other member is a slave
//! that waits on the external sync line ([`EXTERNAL_TRIGGER_CHANNEL`]) which
//! the master drives when its own trigger fires.
//!
//! Channels are numbered globally in member order: a 24-channel master and a
//! 16-channel slave expose channels 0..=23 (master) and 24..=39 (slave).
//!
//! ```text
//!   arm slave 1 ─► arm slave 2 ─► … ─► arm master
//!                                          │ trigger
//!   completions (any order) ──► all ok? ──► remap to global ──► complete
//!                                  └─ no ─► stop the rest ──► fail
//! ```

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use la_core::{
    AnalyzerChannel, AnalyzerDriver, CaptureError, CaptureHandle, CaptureLimits,
    CaptureRejection, CaptureSession, ConnectError, ConnectionParams, ConnectionResult,
    Connectivity, DeviceCapabilities, DriverConstructionError, DriverState, DriverType,
    SharedDriver, TriggerCapabilities, TriggerType, EXTERNAL_TRIGGER_CHANNEL,
};
use la_drivers::{EmulatedAnalyzer, LogicAnalyzerDriver};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::instrument;

pub const MIN_DEVICES: usize = 2;
pub const MAX_DEVICES: usize = 5;

/// Reject ensembles outside `MIN_DEVICES..=MAX_DEVICES`.
pub fn check_device_count(count: usize) -> Result<(), DriverConstructionError> {
    if (MIN_DEVICES..=MAX_DEVICES).contains(&count) {
        Ok(())
    } else {
        Err(DriverConstructionError::DeviceCount {
            count,
            min: MIN_DEVICES,
            max: MAX_DEVICES,
        })
    }
}

/// Build a member driver from a connection string.
///
/// Emulated analyzers are recognised by prefix, `host:port` strings go to the
/// binary protocol over TCP and everything else is treated as a serial port.
pub fn member_from_connection_string(
    connection: &str,
) -> Result<SharedDriver, DriverConstructionError> {
    let conn = la_core::error::require_connection_string(connection)?;
    let lower = conn.to_ascii_lowercase();
    if lower == la_drivers::emulated::CONNECTION_PREFIX
        || lower.starts_with(&format!("{}:", la_drivers::emulated::CONNECTION_PREFIX))
    {
        return Ok(Arc::new(EmulatedAnalyzer::new(conn)?));
    }
    let driver = if conn.contains(':') && !conn.to_ascii_uppercase().starts_with("COM") {
        LogicAnalyzerDriver::network(conn)?
    } else {
        LogicAnalyzerDriver::serial(conn)?
    };
    Ok(Arc::new(driver))
}

/// Where a member's channels sit in the global channel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberSlot {
    pub offset: u32,
    pub channels: u32,
}

/// Cumulative channel offsets in member order.
pub fn member_slots(channel_counts: &[u32]) -> Vec<MemberSlot> {
    let mut offset = 0;
    channel_counts
        .iter()
        .map(|&channels| {
            let slot = MemberSlot { offset, channels };
            offset += channels;
            slot
        })
        .collect()
}

/// Map a global channel number to `(member index, local channel)`.
fn locate(slots: &[MemberSlot], global: u16) -> Option<(usize, u16)> {
    let global = u32::from(global);
    slots.iter().enumerate().find_map(|(i, slot)| {
        (global >= slot.offset && global < slot.offset + slot.channels)
            .then(|| (i, (global - slot.offset) as u16))
    })
}

/// Combine member capabilities: channels add up, frequencies and buffer size
/// take the minimum across members.
pub fn aggregate_capabilities(members: &[DeviceCapabilities]) -> DeviceCapabilities {
    let channel_count: u32 = members.iter().map(|c| c.channel_count).sum();
    let max_frequency = members.iter().map(|c| c.max_frequency).min().unwrap_or(0);
    let min_frequency = members.iter().map(|c| c.min_frequency).min().unwrap_or(0);
    let blast_frequency = members.iter().map(|c| c.blast_frequency).min().unwrap_or(0);
    let buffer_size = members.iter().map(|c| c.buffer_size).min().unwrap_or(0);

    // Triggers are evaluated by the master alone; blast needs no trigger to
    // distribute and cannot be synchronized.
    let mut triggers = members
        .first()
        .map(|c| c.triggers.clone())
        .unwrap_or_default();
    triggers.types.retain(|t| *t != TriggerType::Blast);

    let mut connectivity = Connectivity::default();
    for caps in members {
        for interface in &caps.connectivity.interfaces {
            if !connectivity.interfaces.contains(interface) {
                connectivity.interfaces.push(interface.clone());
            }
        }
        for protocol in &caps.connectivity.protocols {
            if !connectivity.protocols.contains(protocol) {
                connectivity.protocols.push(protocol.clone());
            }
        }
    }

    DeviceCapabilities {
        channel_count,
        min_frequency: min_frequency.min(max_frequency),
        max_frequency,
        blast_frequency,
        buffer_size,
        capture_modes: DeviceCapabilities::modes_for_channel_count(channel_count),
        triggers,
        connectivity,
    }
}

/// Split an ensemble session into per-member sessions.
///
/// The master (index 0) is always armed since it drives the sync line; other
/// members are `None` when none of their channels were selected.
pub fn plan_capture(
    session: &CaptureSession,
    slots: &[MemberSlot],
) -> Result<Vec<Option<CaptureSession>>, CaptureError> {
    session.validate_structure()?;
    let Some(master) = slots.first() else {
        return Err(CaptureError::not_connected());
    };
    if session.trigger_type == TriggerType::Blast {
        return Err(CaptureError::BadParams(
            "blast captures cannot be synchronized across devices".into(),
        ));
    }

    let total: u32 = slots.iter().map(|s| s.channels).sum();
    let mut channels: Vec<Vec<AnalyzerChannel>> = vec![Vec::new(); slots.len()];
    for channel in &session.capture_channels {
        let Some((member, local)) = locate(slots, channel.channel_number) else {
            return Err(CaptureError::BadParams(format!(
                "channel {} is beyond the ensemble's {} channels",
                channel.channel_number, total
            )));
        };
        let mut mapped = AnalyzerChannel::new(local);
        mapped.channel_name = channel.channel_name.clone();
        channels[member].push(mapped);
    }

    if session.has_trigger() {
        if let Some(trigger) = session.trigger_channel {
            let width = match session.trigger_type {
                TriggerType::Complex | TriggerType::Fast => {
                    u32::from(session.trigger_bit_count.max(1))
                }
                _ => 1,
            };
            if u32::from(trigger) + width > master.channels {
                return Err(CaptureError::BadParams(format!(
                    "trigger must use the master device's channels 0..{}",
                    master.channels
                )));
            }
        }
    }

    let mut plan = Vec::with_capacity(slots.len());
    for (index, member_channels) in channels.into_iter().enumerate() {
        let mut sub = session.clone_settings();
        sub.bursts = None;
        if index == 0 {
            sub.capture_channels = member_channels;
            if sub.capture_channels.is_empty() {
                // Scratch channel so the master can be armed; dropped on merge.
                sub.capture_channels
                    .push(AnalyzerChannel::new(session.trigger_channel.unwrap_or(0)));
            }
            plan.push(Some(sub));
        } else if member_channels.is_empty() {
            plan.push(None);
        } else {
            sub.capture_channels = member_channels;
            sub.measure_bursts = false;
            plan.push(Some(sub.with_edge_trigger(EXTERNAL_TRIGGER_CHANNEL, false)));
        }
    }
    Ok(plan)
}

/// Copy member samples into the ensemble session under global numbering.
///
/// Channels the caller did not select (the master's scratch channel) are
/// discarded. Burst boundaries come from the master.
pub fn merge_member_results(
    session: &mut CaptureSession,
    results: Vec<(usize, CaptureSession)>,
    slots: &[MemberSlot],
) {
    for (member, member_session) in results {
        let Some(slot) = slots.get(member) else {
            continue;
        };
        for channel in member_session.capture_channels {
            let global = slot.offset + u32::from(channel.channel_number);
            if let Some(target) = session
                .capture_channels
                .iter_mut()
                .find(|c| u32::from(c.channel_number) == global)
            {
                target.samples = channel.samples;
            }
        }
        if member == 0 {
            session.bursts = member_session.bursts;
        }
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Several analyzers presented as one.
pub struct MultiAnalyzerDriver {
    members: Vec<SharedDriver>,
    slots: RwLock<Vec<MemberSlot>>,
    state: Arc<DriverState>,
}

impl MultiAnalyzerDriver {
    /// Wrap existing member drivers; index 0 becomes the trigger master.
    pub fn new(members: Vec<SharedDriver>) -> Result<Self, DriverConstructionError> {
        check_device_count(members.len())?;
        Ok(Self {
            members,
            slots: RwLock::new(Vec::new()),
            state: DriverState::new(),
        })
    }

    pub fn from_connection_strings<S: AsRef<str>>(
        connections: &[S],
    ) -> Result<Self, DriverConstructionError> {
        Self::with_factory(connections, member_from_connection_string)
    }

    /// Build members with a caller-supplied factory, e.g. the registry's.
    ///
    /// The member count is checked before any member is built.
    pub fn with_factory<S, F, E>(connections: &[S], factory: F) -> Result<Self, E>
    where
        S: AsRef<str>,
        F: Fn(&str) -> Result<SharedDriver, E>,
        E: From<DriverConstructionError>,
    {
        check_device_count(connections.len())?;
        let members = connections
            .iter()
            .map(|c| factory(c.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(members)?)
    }

    pub fn members(&self) -> &[SharedDriver] {
        &self.members
    }

    pub fn master(&self) -> &SharedDriver {
        &self.members[0]
    }

    /// Channel placement of each member; empty until connected.
    pub fn slots(&self) -> Vec<MemberSlot> {
        self.slots.read().clone()
    }

    async fn stop_members(&self, indices: impl IntoIterator<Item = usize>) {
        let stops = indices
            .into_iter()
            .filter_map(|i| self.members.get(i))
            .map(|m| m.stop_capture());
        join_all(stops).await;
    }
}

#[async_trait]
impl AnalyzerDriver for MultiAnalyzerDriver {
    fn state(&self) -> &Arc<DriverState> {
        &self.state
    }

    fn driver_type(&self) -> DriverType {
        DriverType::Multi
    }

    fn is_network(&self) -> bool {
        false
    }

    fn limits(&self, channels: &[u16]) -> CaptureLimits {
        let slots = self.slots.read().clone();
        let mut per_member: Vec<Vec<u16>> = vec![Vec::new(); slots.len()];
        for &global in channels {
            if let Some((member, local)) = locate(&slots, global) {
                per_member[member].push(local);
            }
        }
        let mut combined: Option<CaptureLimits> = None;
        for (index, (member, locals)) in self.members.iter().zip(per_member).enumerate() {
            if index != 0 && locals.is_empty() {
                continue;
            }
            let limits = member.limits(&locals);
            combined = Some(match combined {
                None => limits,
                Some(acc) => CaptureLimits {
                    min_pre_samples: acc.min_pre_samples.max(limits.min_pre_samples),
                    max_pre_samples: acc.max_pre_samples.min(limits.max_pre_samples),
                    min_post_samples: acc.min_post_samples.max(limits.min_post_samples),
                    max_post_samples: acc.max_post_samples.min(limits.max_post_samples),
                    max_total_samples: acc.max_total_samples.min(limits.max_total_samples),
                },
            });
        }
        combined.unwrap_or_else(|| CaptureLimits::unbounded(0))
    }

    #[instrument(skip_all, fields(devices = self.members.len()))]
    async fn connect(&self, params: &ConnectionParams) -> Result<ConnectionResult, ConnectError> {
        if self.state.is_connected() {
            return Err(ConnectError::AlreadyConnected);
        }

        let outcomes = join_all(self.members.iter().map(|m| m.connect(params))).await;
        let failed = outcomes
            .iter()
            .enumerate()
            .find_map(|(i, r)| r.as_ref().err().map(|e| (i, e.to_string())));
        if let Some((index, reason)) = failed {
            tracing::warn!(member = index, %reason, "ensemble member failed to connect");
            let rollbacks = self
                .members
                .iter()
                .zip(&outcomes)
                .filter(|(_, r)| r.is_ok())
                .map(|(m, _)| m.disconnect());
            join_all(rollbacks).await;
            return Err(ConnectError::Connection(format!(
                "device {} failed to connect: {}",
                index, reason
            )));
        }

        let results: Vec<ConnectionResult> = outcomes.into_iter().filter_map(Result::ok).collect();
        let member_caps: Vec<DeviceCapabilities> =
            results.iter().map(|r| r.capabilities.clone()).collect();
        let capabilities = aggregate_capabilities(&member_caps);
        *self.slots.write() =
            member_slots(&member_caps.iter().map(|c| c.channel_count).collect::<Vec<_>>());

        let device_name = format!(
            "Multi-device ({})",
            results
                .iter()
                .map(|r| r.device_name.as_str())
                .collect::<Vec<_>>()
                .join(" + ")
        );
        let version = results.first().and_then(|r| r.device_version.clone());
        self.state
            .mark_connected(&device_name, version.clone(), capabilities.clone());
        tracing::info!(
            devices = self.members.len(),
            channels = capabilities.channel_count,
            "multi-device ensemble connected"
        );
        Ok(ConnectionResult {
            device_name,
            device_version: version,
            capabilities,
        })
    }

    async fn disconnect(&self) {
        self.state.mark_disconnected();
        join_all(self.members.iter().map(|m| m.disconnect())).await;
        self.slots.write().clear();
    }

    #[instrument(skip_all, fields(devices = self.members.len()))]
    async fn start_capture(
        &self,
        session: CaptureSession,
    ) -> Result<CaptureHandle, CaptureRejection> {
        let (ticket, handle) = self.state.begin_capture(session)?;
        let slots = self.slots.read().clone();
        let mut plan = match plan_capture(ticket.session(), &slots) {
            Ok(plan) => plan,
            Err(e) => return Err(ticket.reject(e)),
        };

        // Slaves listen on the sync line before the master can fire it.
        let order = (1..plan.len()).chain(std::iter::once(0));
        let mut armed: Vec<(usize, CaptureHandle)> = Vec::with_capacity(plan.len());
        for index in order {
            let Some(sub) = plan.get_mut(index).and_then(Option::take) else {
                continue;
            };
            match self.members[index].start_capture(sub).await {
                Ok(member_handle) => armed.push((index, member_handle)),
                Err(rejection) => {
                    tracing::warn!(member = index, error = %rejection.error, "arming failed");
                    self.stop_members(armed.iter().map(|(i, _)| *i)).await;
                    return Err(ticket.reject(CaptureError::HardwareError(format!(
                        "device {} failed to arm: {}",
                        index, rejection.error
                    ))));
                }
            }
        }

        let capture_id = ticket.capture_id();
        let members = self.members.clone();
        let task = tokio::spawn(async move {
            let mut ticket = ticket;
            let mut pending: FuturesUnordered<_> = armed
                .into_iter()
                .map(|(index, member_handle)| async move { (index, member_handle.wait().await) })
                .collect();
            let mut results = Vec::with_capacity(pending.len());

            while let Some((index, outcome)) = pending.next().await {
                let failure = match outcome {
                    Ok(done) if done.success => {
                        results.push((index, done.session));
                        continue;
                    }
                    Ok(done) => done
                        .error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "capture failed".to_string()),
                    Err(e) => e.to_string(),
                };
                tracing::warn!(capture_id, member = index, %failure, "member capture failed");
                let others = members
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != index)
                    .map(|(_, m)| m.stop_capture());
                join_all(others).await;
                ticket.fail(CaptureError::HardwareError(format!(
                    "device {} failed during capture: {}",
                    index, failure
                )));
                return;
            }

            merge_member_results(ticket.session_mut(), results, &slots);
            tracing::debug!(capture_id, "synchronized capture merged");
            ticket.complete();
        });
        self.state.attach_capture_task(capture_id, task.abort_handle());
        Ok(handle)
    }

    async fn stop_capture(&self) -> bool {
        if !self.state.is_capturing() {
            return true;
        }
        self.state.abort_capture_task();
        let stopped = join_all(self.members.iter().map(|m| m.stop_capture())).await;
        stopped.into_iter().all(|ok| ok)
    }
}
