//! Wire format for reports and persisted state.
//!
//! Field numbers are part of the device-to-subscriber contract and must not
//! change. Reports are assembled incrementally — previously persisted blobs
//! are appended verbatim next to freshly encoded messages — so alongside the
//! prost message types there is a small append-only writer built on
//! `prost::encoding`.

use prost::encoding::{encode_key, encode_varint, WireType};
use prost::Message;

// ConfigMetricsReportList
pub const FIELD_ID_CONFIG_KEY: u32 = 1;
pub const FIELD_ID_REPORTS: u32 = 2;
pub const FIELD_ID_REPORT_NUMBER: u32 = 3;
pub const FIELD_ID_STATS_ID: u32 = 4;

// ConfigKey
pub const FIELD_ID_UID: u32 = 1;
pub const FIELD_ID_ID: u32 = 2;

// ConfigMetricsReport
pub const FIELD_ID_METRICS: u32 = 1;
pub const FIELD_ID_UID_MAP: u32 = 2;
pub const FIELD_ID_LAST_REPORT_ELAPSED_NANOS: u32 = 3;
pub const FIELD_ID_CURRENT_REPORT_ELAPSED_NANOS: u32 = 4;
pub const FIELD_ID_LAST_REPORT_WALL_CLOCK_NANOS: u32 = 5;
pub const FIELD_ID_CURRENT_REPORT_WALL_CLOCK_NANOS: u32 = 6;
pub const FIELD_ID_DUMP_REPORT_REASON: u32 = 8;
pub const FIELD_ID_STRINGS: u32 = 9;
pub const FIELD_ID_DATA_CORRUPTED_REASON: u32 = 11;

// ActiveConfigList
pub const FIELD_ID_ACTIVE_CONFIG_LIST_CONFIG: u32 = 1;

/// Reasons surfaced in a report's data_corrupted_reason field.
pub const DATA_CORRUPTED_EVENT_QUEUE_OVERFLOW: i32 = 1;
pub const DATA_CORRUPTED_SOCKET_LOSS: i32 = 2;

/// Append-only protobuf writer.
///
/// Exists because reports interleave prost-encoded messages with raw blobs
/// (reports recovered from disk, pre-serialized sub-reports) that must land
/// as length-delimited fields without a decode/re-encode round trip.
#[derive(Default)]
pub struct ProtoOutput {
    buf: Vec<u8>,
}

impl ProtoOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_int32(&mut self, tag: u32, value: i32) {
        encode_key(tag, WireType::Varint, &mut self.buf);
        encode_varint(i64::from(value) as u64, &mut self.buf);
    }

    pub fn write_int64(&mut self, tag: u32, value: i64) {
        encode_key(tag, WireType::Varint, &mut self.buf);
        encode_varint(value as u64, &mut self.buf);
    }

    pub fn write_bool(&mut self, tag: u32, value: bool) {
        encode_key(tag, WireType::Varint, &mut self.buf);
        encode_varint(u64::from(value), &mut self.buf);
    }

    pub fn write_string(&mut self, tag: u32, value: &str) {
        self.write_blob(tag, value.as_bytes());
    }

    /// Writes pre-serialized message bytes as a length-delimited field.
    pub fn write_blob(&mut self, tag: u32, bytes: &[u8]) {
        encode_key(tag, WireType::LengthDelimited, &mut self.buf);
        encode_varint(bytes.len() as u64, &mut self.buf);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_message<M: Message>(&mut self, tag: u32, msg: &M) {
        encode_key(tag, WireType::LengthDelimited, &mut self.buf);
        encode_varint(msg.encoded_len() as u64, &mut self.buf);
        msg.encode_raw(&mut self.buf);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// ConfigKey as written into report headers.
#[derive(Clone, PartialEq, Message)]
pub struct ConfigKeyMsg {
    #[prost(int32, tag = "1")]
    pub uid: i32,
    #[prost(int64, tag = "2")]
    pub id: i64,
}

/// Experiment-id list carried inside the binary-push and rollback atoms.
#[derive(Clone, PartialEq, Message)]
pub struct ExperimentIds {
    #[prost(int64, repeated, packed = "false", tag = "1")]
    pub experiment_id: Vec<i64>,
}

impl ExperimentIds {
    pub fn serialize(ids: &[i64]) -> Vec<u8> {
        let msg = ExperimentIds {
            experiment_id: ids.to_vec(),
        };
        msg.encode_to_vec()
    }

    pub fn parse(bytes: &[u8]) -> Result<Vec<i64>, prost::DecodeError> {
        ExperimentIds::decode(bytes).map(|m| m.experiment_id)
    }
}

/// On-disk record for one install train.
#[derive(Clone, PartialEq, Message)]
pub struct TrainInfoRecord {
    #[prost(int64, tag = "1")]
    pub train_version_code: i64,
    #[prost(string, tag = "2")]
    pub train_name: String,
    #[prost(int32, tag = "3")]
    pub status: i32,
    #[prost(int64, repeated, packed = "false", tag = "4")]
    pub experiment_id: Vec<i64>,
    #[prost(bool, tag = "5")]
    pub requires_staging: bool,
    #[prost(bool, tag = "6")]
    pub rollback_enabled: bool,
    #[prost(bool, tag = "7")]
    pub requires_low_latency_monitor: bool,
}

/// One package row in a uid-map snapshot.
#[derive(Clone, PartialEq, Message)]
pub struct PackageRecord {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, tag = "2")]
    pub version: i64,
    #[prost(int32, tag = "3")]
    pub uid: i32,
    #[prost(string, tag = "4")]
    pub version_string: String,
    #[prost(string, tag = "5")]
    pub installer: String,
    #[prost(bytes = "vec", tag = "6")]
    pub certificate_hash: Vec<u8>,
    #[prost(bool, tag = "7")]
    pub deleted: bool,
}

/// Uid-map delta appended to each report.
#[derive(Clone, PartialEq, Message)]
pub struct UidMapping {
    #[prost(int64, tag = "1")]
    pub snapshot_elapsed_nanos: i64,
    #[prost(message, repeated, tag = "2")]
    pub records: Vec<PackageRecord>,
}

/// Activation state of one metric, persisted across reboots.
#[derive(Clone, PartialEq, Message)]
pub struct ActiveMetricState {
    #[prost(int64, tag = "1")]
    pub metric_id: i64,
    #[prost(bool, tag = "2")]
    pub active: bool,
    #[prost(int64, tag = "3")]
    pub remaining_ttl_nanos: i64,
}

/// Activation state of one configuration.
#[derive(Clone, PartialEq, Message)]
pub struct ActiveConfig {
    #[prost(int32, tag = "1")]
    pub uid: i32,
    #[prost(int64, tag = "2")]
    pub id: i64,
    #[prost(message, repeated, tag = "3")]
    pub metric: Vec<ActiveMetricState>,
}

/// All active configurations, persisted before shutdown.
#[derive(Clone, PartialEq, Message)]
pub struct ActiveConfigList {
    #[prost(message, repeated, tag = "1")]
    pub config: Vec<ActiveConfig>,
}

/// Anomaly refractory state of one alert.
#[derive(Clone, PartialEq, Message)]
pub struct AlertMetadata {
    #[prost(int64, tag = "1")]
    pub alert_id: i64,
    #[prost(int64, tag = "2")]
    pub last_refractory_ends_sec: i64,
}

/// Metadata for one configuration.
#[derive(Clone, PartialEq, Message)]
pub struct StatsMetadata {
    #[prost(message, optional, tag = "1")]
    pub config_key: Option<ConfigKeyMsg>,
    #[prost(message, repeated, tag = "2")]
    pub alert_metadata: Vec<AlertMetadata>,
}

/// Metadata for all configurations, persisted across reboots.
#[derive(Clone, PartialEq, Message)]
pub struct StatsMetadataList {
    #[prost(message, repeated, tag = "1")]
    pub stats_metadata: Vec<StatsMetadata>,
}

/// One aggregated bucket inside a metric report.
#[derive(Clone, PartialEq, Message)]
pub struct BucketInfo {
    #[prost(int64, tag = "1")]
    pub start_bucket_elapsed_nanos: i64,
    #[prost(int64, tag = "2")]
    pub end_bucket_elapsed_nanos: i64,
    #[prost(int64, tag = "3")]
    pub count: i64,
    #[prost(int64, tag = "4")]
    pub sum: i64,
    #[prost(int64, tag = "5")]
    pub min: i64,
    #[prost(int64, tag = "6")]
    pub max: i64,
    #[prost(string, tag = "7")]
    pub dimension_key: String,
    #[prost(int64, tag = "8")]
    pub bucket_num: i64,
}

/// Report for one metric within a configuration.
#[derive(Clone, PartialEq, Message)]
pub struct StatsLogReport {
    #[prost(int64, tag = "1")]
    pub metric_id: i64,
    #[prost(message, repeated, tag = "2")]
    pub bucket: Vec<BucketInfo>,
}
