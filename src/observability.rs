//! Metric definitions.
//!
//! aircast emits through the `metrics` facade; the embedder decides which
//! recorder (if any) to install. Call [`describe_metrics`] once at startup to
//! register descriptions with the recorder.

use metrics::Unit;

/// TS packets accepted by the demultiplexer.
pub const TS_PACKETS: &str = "aircast_ts_packets_total";

/// Input bytes discarded while hunting for a sync byte.
pub const TS_SYNC_ERRORS: &str = "aircast_ts_sync_errors_total";

/// Packets dropped for a set transport_error_indicator.
pub const TS_TRANSPORT_ERRORS: &str = "aircast_ts_transport_errors_total";

/// PES payloads dropped on a continuity-counter mismatch.
pub const TS_CONTINUITY_ERRORS: &str = "aircast_ts_continuity_errors_total";

/// Complete PES packets reassembled.
pub const TS_PES_PACKETS: &str = "aircast_ts_pes_packets_total";

/// Access units delivered to packet sources.
pub const TS_ACCESS_UNITS: &str = "aircast_ts_access_units_total";

/// Bitrate changes emitted by the QoS policy.
pub const QOS_BITRATE_CHANGES: &str = "aircast_qos_bitrate_changes_total";

/// Pause/resume edges emitted by the buffering policy.
pub const QOS_BUFFERING_EDGES: &str = "aircast_qos_buffering_edges_total";

/// RTSP messages handled by the sink.
pub const RTSP_MESSAGES: &str = "aircast_rtsp_messages_total";

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(TS_PACKETS, Unit::Count, "TS packets accepted");
    metrics::describe_counter!(
        TS_SYNC_ERRORS,
        Unit::Bytes,
        "Bytes discarded while resynchronizing"
    );
    metrics::describe_counter!(
        TS_TRANSPORT_ERRORS,
        Unit::Count,
        "Packets dropped for transport_error_indicator"
    );
    metrics::describe_counter!(
        TS_CONTINUITY_ERRORS,
        Unit::Count,
        "PES payloads dropped on continuity mismatch"
    );
    metrics::describe_counter!(TS_PES_PACKETS, Unit::Count, "PES packets reassembled");
    metrics::describe_counter!(
        TS_ACCESS_UNITS,
        Unit::Count,
        "Access units delivered downstream"
    );
    metrics::describe_counter!(
        QOS_BITRATE_CHANGES,
        Unit::Count,
        "Encoder bitrate changes requested"
    );
    metrics::describe_counter!(
        QOS_BUFFERING_EDGES,
        Unit::Count,
        "Pause/resume transitions of the buffering policy"
    );
    metrics::describe_counter!(RTSP_MESSAGES, Unit::Count, "RTSP messages handled");
}
