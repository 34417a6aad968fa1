//! Snapshot documents and phase accumulation
//!
//! Workbench submits a computer's snapshot in ordered phases (hardware info,
//! disk tests, stress test, erase and, optionally, OS install). Each phase is
//! merged into one growing JSON document. A separate link signal attaches a
//! persistent device identifier; once every phase is in and the link
//! condition holds, the snapshot is ready to be uploaded to DeviceHub.

use crate::error::WorkbenchError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

pub type Document = Map<String, Value>;

pub const UUID: &str = "_uuid";
pub const PHASES: &str = "_phases";
pub const TOTAL_PHASES: &str = "_totalPhases";
pub const LINKED: &str = "_linked";
pub const UPLOADED: &str = "_uploaded";
pub const UPLOAD_ERROR: &str = "_uploadError";
pub const CREATED: &str = "_created";
pub const UPDATED: &str = "_updated";

/// Phases of a regular run: hardware info, disk tests, stress test, erase.
pub const DEFAULT_TOTAL_PHASES: u64 = 4;
/// Regular run plus OS install.
pub const TOTAL_PHASES_WITH_OS: u64 = 5;

/// Keys owned by the server. Patches cannot set them and they are not exported.
const PROTECTED: [&str; 7] = [
    UUID,
    PHASES,
    TOTAL_PHASES,
    UPLOADED,
    UPLOAD_ERROR,
    CREATED,
    UPDATED,
];

/// Keys stripped from the exported document. `_uuid` stays: DeviceHub
/// deduplicates snapshots with it.
const BOOKKEEPING: [&str; 7] = [
    PHASES,
    TOTAL_PHASES,
    LINKED,
    UPLOADED,
    UPLOAD_ERROR,
    CREATED,
    UPDATED,
];

/// What a patch did to the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// A phase payload; carries the phase count after merging.
    Phase(u64),
    /// A phase payload received after every phase was already in.
    ExtraPhase,
    /// A link signal.
    Link(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    Collecting,
    Complete,
    Uploaded,
    UploadFailed,
}

impl SnapshotState {
    /// Name of the inventory bucket the dashboard lists the snapshot under.
    pub fn inventory_label(self) -> &'static str {
        match self {
            SnapshotState::Collecting => "new",
            SnapshotState::Complete => "consolidated",
            SnapshotState::Uploaded => "uploaded",
            SnapshotState::UploadFailed => "uploaderror",
        }
    }
}

fn timestamp(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// Merge `incoming` into `target`. Objects present on both sides are merged
/// key by key; anything else is replaced.
fn merge(target: &mut Document, incoming: Document) {
    for (key, value) in incoming {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(update)) => merge(existing, update),
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    doc: Document,
}

impl Snapshot {
    pub fn new(uuid: Uuid, total_phases: u64, now: DateTime<Utc>) -> Self {
        let mut doc = Document::new();
        doc.insert(UUID.into(), Value::String(uuid.to_string()));
        doc.insert(PHASES.into(), Value::from(0u64));
        doc.insert(TOTAL_PHASES.into(), Value::from(total_phases));
        doc.insert(LINKED.into(), Value::Bool(false));
        doc.insert(CREATED.into(), timestamp(now));
        doc.insert(UPDATED.into(), timestamp(now));
        Self { doc }
    }

    /// Rebuild a snapshot read back from storage.
    pub fn from_document(doc: Document) -> Result<Self, WorkbenchError> {
        match doc.get(UUID).and_then(Value::as_str) {
            Some(raw) if Uuid::parse_str(raw).is_ok() => Ok(Self { doc }),
            _ => Err(WorkbenchError::ValidationError(
                "snapshot document without a valid _uuid".into(),
            )),
        }
    }

    pub fn uuid(&self) -> &str {
        self.doc.get(UUID).and_then(Value::as_str).unwrap_or_default()
    }

    pub fn phases(&self) -> u64 {
        self.doc.get(PHASES).and_then(Value::as_u64).unwrap_or(0)
    }

    pub fn total_phases(&self) -> u64 {
        self.doc
            .get(TOTAL_PHASES)
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TOTAL_PHASES)
    }

    pub fn is_linked(&self) -> bool {
        self.doc.get(LINKED).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn is_uploaded(&self) -> bool {
        self.doc.contains_key(UPLOADED)
    }

    pub fn created(&self) -> &str {
        self.doc.get(CREATED).and_then(Value::as_str).unwrap_or_default()
    }

    pub fn upload_error(&self) -> Option<&Value> {
        self.doc.get(UPLOAD_ERROR)
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// Merge a patch from Workbench.
    ///
    /// A patch carrying `_linked` is a link signal and leaves the phase
    /// counter alone; any other patch is the next phase.
    pub fn apply_patch(
        &mut self,
        patch: Value,
        now: DateTime<Utc>,
    ) -> Result<PatchKind, WorkbenchError> {
        let Value::Object(mut patch) = patch else {
            return Err(WorkbenchError::InvalidPatch(
                "expected a JSON object".into(),
            ));
        };

        for key in PROTECTED {
            patch.remove(key);
        }

        let link = match patch.get(LINKED) {
            None => None,
            Some(Value::Bool(linked)) => Some(*linked),
            Some(_) => {
                return Err(WorkbenchError::InvalidPatch(
                    "_linked must be a boolean".into(),
                ))
            }
        };

        merge(&mut self.doc, patch);

        let kind = match link {
            Some(linked) => PatchKind::Link(linked),
            None if self.phases() >= self.total_phases() => {
                warn!(
                    uuid = self.uuid(),
                    total = self.total_phases(),
                    "Phase received after all phases were completed"
                );
                PatchKind::ExtraPhase
            }
            None => {
                let phases = self.phases() + 1;
                self.doc.insert(PHASES.into(), Value::from(phases));
                PatchKind::Phase(phases)
            }
        };

        self.doc.insert(UPDATED.into(), timestamp(now));
        Ok(kind)
    }

    /// Attach identifiers to the device and mark the snapshot linked.
    pub fn tag(&mut self, device_fields: Document, now: DateTime<Utc>) {
        let mut patch = Document::new();
        patch.insert("device".into(), Value::Object(device_fields));
        merge(&mut self.doc, patch);
        self.doc.insert(LINKED.into(), Value::Bool(true));
        self.doc.insert(UPDATED.into(), timestamp(now));
    }

    pub fn state(&self) -> SnapshotState {
        if self.is_uploaded() {
            SnapshotState::Uploaded
        } else if self.upload_error().is_some() {
            SnapshotState::UploadFailed
        } else if self.phases() < self.total_phases() {
            SnapshotState::Collecting
        } else {
            SnapshotState::Complete
        }
    }

    /// Whether the snapshot should be uploaded now.
    pub fn is_ready(&self, link_required: bool, usb_plugged: bool) -> bool {
        self.phases() >= self.total_phases()
            && !self.is_uploaded()
            && (!link_required || (self.is_linked() && usb_plugged))
    }

    pub fn mark_uploaded(&mut self, at: DateTime<Utc>) {
        self.doc.remove(UPLOAD_ERROR);
        self.doc.insert(UPLOADED.into(), timestamp(at));
        self.doc.insert(UPDATED.into(), timestamp(at));
    }

    pub fn mark_failed(&mut self, status: Option<u16>, response: String, at: DateTime<Utc>) {
        self.doc.insert(
            UPLOAD_ERROR.into(),
            serde_json::json!({ "status": status, "response": response }),
        );
        self.doc.insert(UPDATED.into(), timestamp(at));
    }

    /// The document as written to disk and sent to DeviceHub.
    pub fn export(&self) -> Document {
        let mut doc = self.doc.clone();
        for key in BOOKKEEPING {
            doc.remove(key);
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> Snapshot {
        Snapshot::new(Uuid::new_v4(), DEFAULT_TOTAL_PHASES, Utc::now())
    }

    fn run_phases(s: &mut Snapshot, n: usize) {
        for i in 0..n {
            s.apply_patch(json!({ format!("phase{i}"): true }), Utc::now())
                .unwrap();
        }
    }

    #[test]
    fn phases_count_up_to_total() {
        let mut s = snapshot();
        assert_eq!(s.state(), SnapshotState::Collecting);

        let kind = s
            .apply_patch(json!({"device": {"serialNumber": "S1"}}), Utc::now())
            .unwrap();
        assert_eq!(kind, PatchKind::Phase(1));

        run_phases(&mut s, 3);
        assert_eq!(s.phases(), 4);
        assert_eq!(s.state(), SnapshotState::Complete);

        let extra = s.apply_patch(json!({"late": 1}), Utc::now()).unwrap();
        assert_eq!(extra, PatchKind::ExtraPhase);
        assert_eq!(s.phases(), 4);
        assert_eq!(s.document()["late"], 1);
    }

    #[test]
    fn link_keeps_nested_device_fields() {
        let mut s = snapshot();
        s.apply_patch(
            json!({"device": {"serialNumber": "S1", "type": "Desktop"}, "components": [1, 2]}),
            Utc::now(),
        )
        .unwrap();

        let kind = s
            .apply_patch(json!({"device": {"_id": "foo-id"}, "_linked": true}), Utc::now())
            .unwrap();

        assert_eq!(kind, PatchKind::Link(true));
        assert_eq!(s.phases(), 1, "link signals are not phases");
        assert!(s.is_linked());
        assert_eq!(s.document()["device"]["_id"], "foo-id");
        assert_eq!(s.document()["device"]["serialNumber"], "S1");
        assert_eq!(s.document()["components"], json!([1, 2]));
    }

    #[test]
    fn arrays_are_replaced_not_merged() {
        let mut s = snapshot();
        s.apply_patch(json!({"tests": [1, 2, 3]}), Utc::now()).unwrap();
        s.apply_patch(json!({"tests": [4]}), Utc::now()).unwrap();
        assert_eq!(s.document()["tests"], json!([4]));
    }

    #[test]
    fn patches_cannot_forge_bookkeeping() {
        let mut s = snapshot();
        let uuid = s.uuid().to_string();
        s.apply_patch(
            json!({"_uuid": "other", "_phases": 99, "_uploaded": "yes"}),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(s.uuid(), uuid);
        assert_eq!(s.phases(), 1);
        assert!(!s.is_uploaded());
    }

    #[test]
    fn rejects_non_object_and_bad_link() {
        let mut s = snapshot();
        assert!(matches!(
            s.apply_patch(json!([1, 2]), Utc::now()),
            Err(WorkbenchError::InvalidPatch(_))
        ));
        assert!(matches!(
            s.apply_patch(json!({"_linked": "yes"}), Utc::now()),
            Err(WorkbenchError::InvalidPatch(_))
        ));
        assert_eq!(s.phases(), 0);
    }

    #[test]
    fn readiness_waits_for_link_and_usb() {
        let mut s = snapshot();
        run_phases(&mut s, 3);
        assert!(!s.is_ready(false, false));

        run_phases(&mut s, 1);
        assert!(s.is_ready(false, false));
        assert!(!s.is_ready(true, true), "not linked yet");

        s.apply_patch(json!({"_linked": true}), Utc::now()).unwrap();
        assert!(!s.is_ready(true, false), "no USB plugged");
        assert!(s.is_ready(true, true));

        s.mark_uploaded(Utc::now());
        assert!(!s.is_ready(false, true));
        assert_eq!(s.state(), SnapshotState::Uploaded);
    }

    #[test]
    fn os_install_adds_a_fifth_phase() {
        let mut s = Snapshot::new(Uuid::new_v4(), TOTAL_PHASES_WITH_OS, Utc::now());
        run_phases(&mut s, 4);
        assert_eq!(s.state(), SnapshotState::Collecting);
        run_phases(&mut s, 1);
        assert_eq!(s.state(), SnapshotState::Complete);
    }

    #[test]
    fn failure_then_success_clears_error() {
        let mut s = snapshot();
        run_phases(&mut s, 4);
        s.mark_failed(Some(500), "boom".into(), Utc::now());
        assert_eq!(s.state(), SnapshotState::UploadFailed);
        assert!(s.is_ready(false, false), "failed uploads can be retried");
        assert_eq!(s.upload_error().unwrap()["status"], 500);

        s.mark_uploaded(Utc::now());
        assert!(s.upload_error().is_none());
        assert_eq!(s.state(), SnapshotState::Uploaded);
    }

    #[test]
    fn tag_merges_into_device_and_links() {
        let mut s = snapshot();
        s.apply_patch(json!({"device": {"serialNumber": "S1"}}), Utc::now())
            .unwrap();
        let mut fields = Document::new();
        fields.insert("label".into(), json!("PC-7"));
        s.tag(fields, Utc::now());
        assert!(s.is_linked());
        assert_eq!(s.document()["device"]["label"], "PC-7");
        assert_eq!(s.document()["device"]["serialNumber"], "S1");
    }

    #[test]
    fn export_strips_bookkeeping() {
        let mut s = snapshot();
        s.apply_patch(json!({"device": {"serialNumber": "S1"}, "_linked": true}), Utc::now())
            .unwrap();
        let exported = s.export();
        assert_eq!(exported[UUID], s.uuid());
        assert!(!exported.contains_key(PHASES));
        assert!(!exported.contains_key(LINKED));
        assert!(!exported.contains_key(CREATED));
        assert_eq!(exported["device"]["serialNumber"], "S1");
    }

    #[test]
    fn from_document_requires_uuid() {
        let s = snapshot();
        let doc = s.document().clone();
        assert_eq!(Snapshot::from_document(doc).unwrap(), s);
        assert!(Snapshot::from_document(Document::new()).is_err());
    }
}
