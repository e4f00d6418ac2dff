use crate::concurrent::counters::{CountersManager, SYSTEM_COUNTER_TYPE_ID};
use crate::concurrent::position::Position;
use crate::error::DriverResult;

/// Driver-wide counters allocated once at start-up, in a fixed order so
/// their ids are stable across runs.
pub struct SystemCounters {
    pub errors: Position,
    pub invalid_packets: Position,
    pub short_sends: Position,
    pub flow_control_under_runs: Position,
    pub flow_control_over_runs: Position,
    pub naks_sent: Position,
    pub naks_received: Position,
    pub status_messages_sent: Position,
    pub status_messages_received: Position,
    pub retransmits_sent: Position,
    pub retransmitted_bytes: Position,
    pub heartbeats_sent: Position,
    pub heartbeats_received: Position,
    pub setups_sent: Position,
    pub unblocked_publications: Position,
    pub unblocked_commands: Position,
    pub client_timeouts: Position,
    pub images_created: Position,
    pub images_lingered: Position,
    pub back_pressure_events: Position,
    pub possible_ttl_asymmetry: Position,
    pub resolution_changes: Position,
}

impl SystemCounters {
    pub fn allocate(manager: &mut CountersManager, now_ms: i64) -> DriverResult<SystemCounters> {
        let mut alloc = |label: &str| -> DriverResult<Position> {
            let id = manager.allocate(SYSTEM_COUNTER_TYPE_ID, &[], label, now_ms)?;
            Ok(manager.position(id))
        };

        Ok(SystemCounters {
            errors: alloc("Errors")?,
            invalid_packets: alloc("Invalid packets")?,
            short_sends: alloc("Short sends")?,
            flow_control_under_runs: alloc("Flow control under runs")?,
            flow_control_over_runs: alloc("Flow control over runs")?,
            naks_sent: alloc("NAKs sent")?,
            naks_received: alloc("NAKs received")?,
            status_messages_sent: alloc("Status messages sent")?,
            status_messages_received: alloc("Status messages received")?,
            retransmits_sent: alloc("Retransmits sent")?,
            retransmitted_bytes: alloc("Retransmitted bytes")?,
            heartbeats_sent: alloc("Heartbeats sent")?,
            heartbeats_received: alloc("Heartbeats received")?,
            setups_sent: alloc("Setup frames sent")?,
            unblocked_publications: alloc("Unblocked publications")?,
            unblocked_commands: alloc("Unblocked control commands")?,
            client_timeouts: alloc("Client liveness timeouts")?,
            images_created: alloc("Images created")?,
            images_lingered: alloc("Images lingered")?,
            back_pressure_events: alloc("Back pressure events")?,
            possible_ttl_asymmetry: alloc("Possible TTL asymmetry")?,
            resolution_changes: alloc("Resolution changes")?,
        })
    }
}
