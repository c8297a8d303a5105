//! Core kernel types: participant IDs, reference strings, capdata.
//!
//! Every reference type here has a bit-exact string form that is used in
//! persisted keys, transcripts and logs:
//!
//! ```text
//! kernel:  ko<N>  kp<N>  kd<N>
//! vat:     o+<N>  o-<N>  p+<N>  p-<N>  d+<N>  d-<N>  o+v<K>/<I>  o+d<K>/<I>
//! ids:     v<N> (vat)  d<N> (device)
//! ```
//!
//! All of them serialize through their string form, so they can be used as
//! JSON map keys.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

// ============================================================================
// ID allocation starts
// ============================================================================

/// First vat ID handed out (`v1`).
pub const FIRST_VAT_ID: u64 = 1;
/// First device ID handed out (`d7`).
pub const FIRST_DEVICE_ID: u64 = 7;
/// First kernel object ID (`ko20`).
pub const FIRST_OBJECT_ID: u64 = 20;
/// First kernel device node ID (`kd30`).
pub const FIRST_DEVNODE_ID: u64 = 30;
/// First kernel promise ID (`kp40`).
pub const FIRST_PROMISE_ID: u64 = 40;
/// First object import ID in a c-list (`o-50`).
pub const FIRST_IMPORT_OBJECT_ID: u64 = 50;
/// First promise import ID in a c-list (`p-60`).
pub const FIRST_IMPORT_PROMISE_ID: u64 = 60;
/// First device node import ID in a c-list (`d-70`).
pub const FIRST_IMPORT_DEVICE_ID: u64 = 70;

/// Implement `Serialize`/`Deserialize` through `Display`/`FromStr`.
macro_rules! string_serde {
    ($ty:ty, $what:literal) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse()
                    .map_err(|_| serde::de::Error::custom(format!("invalid {}: {}", $what, s)))
            }
        }
    };
}

fn parse_num(s: &str, whole: &str) -> KernelResult<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(KernelError::InvalidRef(whole.to_string()));
    }
    // Leading zeros would give one ID two spellings
    if s.len() > 1 && s.starts_with('0') {
        return Err(KernelError::InvalidRef(whole.to_string()));
    }
    s.parse()
        .map_err(|_| KernelError::InvalidRef(whole.to_string()))
}

// ============================================================================
// Participants
// ============================================================================

/// Vat identifier (`v<N>`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VatId(pub u64);

impl fmt::Display for VatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for VatId {
    type Err = KernelError;

    fn from_str(s: &str) -> KernelResult<Self> {
        match s.strip_prefix('v') {
            Some(rest) => Ok(VatId(parse_num(rest, s)?)),
            None => Err(KernelError::InvalidRef(s.to_string())),
        }
    }
}

string_serde!(VatId, "vat id");

/// Device identifier (`d<N>`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = KernelError;

    fn from_str(s: &str) -> KernelResult<Self> {
        match s.strip_prefix('d') {
            Some(rest) => Ok(DeviceId(parse_num(rest, s)?)),
            None => Err(KernelError::InvalidRef(s.to_string())),
        }
    }
}

string_serde!(DeviceId, "device id");

/// Anything that owns a c-list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Participant {
    Vat(VatId),
    Device(DeviceId),
}

impl Participant {
    /// The vat, if this participant is one.
    pub fn vat(&self) -> Option<VatId> {
        match self {
            Participant::Vat(v) => Some(*v),
            Participant::Device(_) => None,
        }
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Participant::Vat(v) => v.fmt(f),
            Participant::Device(d) => d.fmt(f),
        }
    }
}

impl FromStr for Participant {
    type Err = KernelError;

    fn from_str(s: &str) -> KernelResult<Self> {
        if s.starts_with('v') {
            Ok(Participant::Vat(s.parse()?))
        } else {
            Ok(Participant::Device(s.parse()?))
        }
    }
}

impl From<VatId> for Participant {
    fn from(v: VatId) -> Self {
        Participant::Vat(v)
    }
}

impl From<DeviceId> for Participant {
    fn from(d: DeviceId) -> Self {
        Participant::Device(d)
    }
}

string_serde!(Participant, "participant");

// ============================================================================
// Kernel references
// ============================================================================

/// Kind of thing a reference designates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefType {
    Object,
    Promise,
    Device,
}

impl RefType {
    /// Name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            RefType::Object => "object",
            RefType::Promise => "promise",
            RefType::Device => "device",
        }
    }
}

/// Kernel-global reference (`ko<N>`, `kp<N>`, `kd<N>`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KRef {
    Object(u64),
    Promise(u64),
    Device(u64),
}

impl KRef {
    pub fn ref_type(&self) -> RefType {
        match self {
            KRef::Object(_) => RefType::Object,
            KRef::Promise(_) => RefType::Promise,
            KRef::Device(_) => RefType::Device,
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self, KRef::Object(_))
    }

    pub fn is_promise(&self) -> bool {
        matches!(self, KRef::Promise(_))
    }

    pub fn is_device(&self) -> bool {
        matches!(self, KRef::Device(_))
    }

    /// Numeric part of the reference.
    pub fn id(&self) -> u64 {
        match self {
            KRef::Object(n) | KRef::Promise(n) | KRef::Device(n) => *n,
        }
    }

    /// Fail unless this is a reference of the given type.
    pub fn expect_type(&self, expected: RefType) -> KernelResult<()> {
        if self.ref_type() == expected {
            Ok(())
        } else {
            Err(KernelError::WrongType {
                expected: expected.name(),
                found: self.to_string(),
            })
        }
    }
}

impl fmt::Display for KRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KRef::Object(n) => write!(f, "ko{}", n),
            KRef::Promise(n) => write!(f, "kp{}", n),
            KRef::Device(n) => write!(f, "kd{}", n),
        }
    }
}

impl FromStr for KRef {
    type Err = KernelError;

    fn from_str(s: &str) -> KernelResult<Self> {
        if let Some(rest) = s.strip_prefix("ko") {
            Ok(KRef::Object(parse_num(rest, s)?))
        } else if let Some(rest) = s.strip_prefix("kp") {
            Ok(KRef::Promise(parse_num(rest, s)?))
        } else if let Some(rest) = s.strip_prefix("kd") {
            Ok(KRef::Device(parse_num(rest, s)?))
        } else {
            Err(KernelError::InvalidRef(s.to_string()))
        }
    }
}

string_serde!(KRef, "kref");

// ============================================================================
// Participant-local references
// ============================================================================

/// Virtual-object flavour of an exported object reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VRefKind {
    /// `o+N`, `o-N`, `p±N`, `d±N`
    Plain,
    /// `o+v<K>/<I>`: virtual object, dies with the incarnation
    Virtual { instance: u64 },
    /// `o+d<K>/<I>`: durable object, survives upgrade
    Durable { instance: u64 },
}

/// Participant-local reference (vref for vats, dref for devices).
///
/// `allocated_by_vat` is the `+`/`-` sign: `+` means the participant
/// allocated (exported) it, `-` means the kernel allocated it on import.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VRef {
    pub ref_type: RefType,
    pub allocated_by_vat: bool,
    pub id: u64,
    pub kind: VRefKind,
}

impl VRef {
    /// `o+<id>`
    pub fn object_export(id: u64) -> Self {
        Self::plain(RefType::Object, true, id)
    }

    /// `o-<id>`
    pub fn object_import(id: u64) -> Self {
        Self::plain(RefType::Object, false, id)
    }

    /// `p+<id>`
    pub fn promise_export(id: u64) -> Self {
        Self::plain(RefType::Promise, true, id)
    }

    /// `p-<id>`
    pub fn promise_import(id: u64) -> Self {
        Self::plain(RefType::Promise, false, id)
    }

    /// `d+<id>`
    pub fn device_export(id: u64) -> Self {
        Self::plain(RefType::Device, true, id)
    }

    /// `d-<id>`
    pub fn device_import(id: u64) -> Self {
        Self::plain(RefType::Device, false, id)
    }

    /// `o+v<kind>/<instance>`
    pub fn virtual_object(kind: u64, instance: u64) -> Self {
        VRef {
            ref_type: RefType::Object,
            allocated_by_vat: true,
            id: kind,
            kind: VRefKind::Virtual { instance },
        }
    }

    /// `o+d<kind>/<instance>`
    pub fn durable_object(kind: u64, instance: u64) -> Self {
        VRef {
            ref_type: RefType::Object,
            allocated_by_vat: true,
            id: kind,
            kind: VRefKind::Durable { instance },
        }
    }

    /// A plain (non-virtual) reference.
    pub fn plain(ref_type: RefType, allocated_by_vat: bool, id: u64) -> Self {
        VRef {
            ref_type,
            allocated_by_vat,
            id,
            kind: VRefKind::Plain,
        }
    }

    /// The vat's root object, `o+0`.
    pub fn root() -> Self {
        Self::object_export(0)
    }

    pub fn is_root(&self) -> bool {
        *self == Self::root()
    }

    /// Whether an export keeps its identity across an upgrade.
    ///
    /// Only the root object and durable virtual objects survive.
    pub fn survives_upgrade(&self) -> bool {
        self.is_root() || matches!(self.kind, VRefKind::Durable { .. })
    }

    /// Fail unless this is a reference of the given type.
    pub fn expect_type(&self, expected: RefType) -> KernelResult<()> {
        if self.ref_type == expected {
            Ok(())
        } else {
            Err(KernelError::WrongType {
                expected: expected.name(),
                found: self.to_string(),
            })
        }
    }
}

impl fmt::Display for VRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self.ref_type {
            RefType::Object => 'o',
            RefType::Promise => 'p',
            RefType::Device => 'd',
        };
        let sign = if self.allocated_by_vat { '+' } else { '-' };
        match self.kind {
            VRefKind::Plain => write!(f, "{}{}{}", letter, sign, self.id),
            VRefKind::Virtual { instance } => {
                write!(f, "{}{}v{}/{}", letter, sign, self.id, instance)
            }
            VRefKind::Durable { instance } => {
                write!(f, "{}{}d{}/{}", letter, sign, self.id, instance)
            }
        }
    }
}

impl FromStr for VRef {
    type Err = KernelError;

    fn from_str(s: &str) -> KernelResult<Self> {
        let invalid = || KernelError::InvalidRef(s.to_string());
        let mut chars = s.chars();
        let ref_type = match chars.next() {
            Some('o') => RefType::Object,
            Some('p') => RefType::Promise,
            Some('d') => RefType::Device,
            _ => return Err(invalid()),
        };
        let allocated_by_vat = match chars.next() {
            Some('+') => true,
            Some('-') => false,
            _ => return Err(invalid()),
        };
        let rest = chars.as_str();

        let virtual_part = rest
            .strip_prefix('v')
            .map(|r| (false, r))
            .or_else(|| rest.strip_prefix('d').map(|r| (true, r)));
        if let Some((durable, body)) = virtual_part {
            // Only exported objects can be virtual
            if ref_type != RefType::Object || !allocated_by_vat {
                return Err(invalid());
            }
            let (kind_id, instance) = body.split_once('/').ok_or_else(invalid)?;
            let id = parse_num(kind_id, s)?;
            let instance = parse_num(instance, s)?;
            let kind = if durable {
                VRefKind::Durable { instance }
            } else {
                VRefKind::Virtual { instance }
            };
            return Ok(VRef {
                ref_type,
                allocated_by_vat,
                id,
                kind,
            });
        }

        Ok(VRef::plain(ref_type, allocated_by_vat, parse_num(rest, s)?))
    }
}

string_serde!(VRef, "vref");

// ============================================================================
// Capability data
// ============================================================================

/// Opaque message payload plus the references it carries.
///
/// The kernel never looks inside `body`; only `slots` matter for
/// reference counting and translation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData<S = KRef> {
    pub body: String,
    pub slots: Vec<S>,
}

impl<S> CapData<S> {
    pub fn new(body: impl Into<String>, slots: Vec<S>) -> Self {
        CapData {
            body: body.into(),
            slots,
        }
    }

    /// Capdata with no slots.
    pub fn bare(body: impl Into<String>) -> Self {
        Self::new(body, Vec::new())
    }

    /// Map every slot, failing on the first error.
    pub fn try_map_slots<T, E, F>(&self, mut f: F) -> Result<CapData<T>, E>
    where
        F: FnMut(&S) -> Result<T, E>,
    {
        let slots = self.slots.iter().map(&mut f).collect::<Result<Vec<_>, _>>()?;
        Ok(CapData {
            body: self.body.clone(),
            slots,
        })
    }
}

/// A method invocation: capdata arguments plus an optional result promise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message<S = KRef> {
    pub methargs: CapData<S>,
    pub result: Option<S>,
}

impl<S> Message<S> {
    pub fn new(methargs: CapData<S>, result: Option<S>) -> Self {
        Message { methargs, result }
    }
}

/// One promise settlement (`[promise, rejected, data]`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution<S = KRef> {
    pub promise: S,
    pub rejected: bool,
    pub data: CapData<S>,
}

// ============================================================================
// Reference counts
// ============================================================================

/// The two liveness tiers of a kernel object.
///
/// Persisted as `"<reachable>,<recognizable>"`. `recognizable >= reachable`
/// always holds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefCounts {
    pub reachable: u32,
    pub recognizable: u32,
}

impl RefCounts {
    pub fn new(reachable: u32, recognizable: u32) -> Self {
        RefCounts {
            reachable,
            recognizable,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.reachable == 0 && self.recognizable == 0
    }
}

impl fmt::Display for RefCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.reachable, self.recognizable)
    }
}

impl FromStr for RefCounts {
    type Err = KernelError;

    fn from_str(s: &str) -> KernelResult<Self> {
        let corrupt = || KernelError::Corrupt(format!("bad refcount pair '{}'", s));
        let (a, b) = s.split_once(',').ok_or_else(corrupt)?;
        let reachable = a.parse().map_err(|_| corrupt())?;
        let recognizable = b.parse().map_err(|_| corrupt())?;
        if reachable > recognizable {
            return Err(corrupt());
        }
        Ok(RefCounts::new(reachable, recognizable))
    }
}

// ============================================================================
// Kernel-generated values
// ============================================================================

/// Error class for sends to ownerless or terminated targets, and for the
/// promises a terminated vat was deciding.
pub const VAT_TERMINATED: &str = "vat terminated";

/// Error class for sends to a promise fulfilled to plain data.
pub const DATA_NOT_CALLABLE: &str = "data is not callable";

/// Build a kernel error value: `#{"#error":"<msg>","name":"Error"}`.
///
/// Senders can always tell these apart from application rejections because
/// the kernel is the only party that fabricates them.
pub fn kernel_error(message: &str) -> CapData {
    let mut record = BTreeMap::new();
    record.insert("#error", message);
    record.insert("name", "Error");
    let json = serde_json::to_string(&record).unwrap_or_default();
    CapData::bare(format!("#{}", json))
}

#[derive(Serialize)]
struct UpgradeDisconnection<'a> {
    #[serde(rename = "incarnationNumber")]
    incarnation_number: u64,
    name: &'a str,
    #[serde(rename = "upgradeMessage")]
    upgrade_message: &'a str,
}

/// Build the rejection used for promises orphaned by an upgrade.
///
/// Carries the incarnation that was replaced so callers can retry against
/// the new one.
pub fn upgrade_disconnection(upgrade_message: &str, incarnation: u64) -> CapData {
    let record = UpgradeDisconnection {
        incarnation_number: incarnation,
        name: "vatUpgraded",
        upgrade_message,
    };
    let json = serde_json::to_string(&record).unwrap_or_default();
    CapData::bare(format!("#{}", json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_kref_string_forms() {
        assert_eq!(KRef::Object(20).to_string(), "ko20");
        assert_eq!("kp40".parse::<KRef>().unwrap(), KRef::Promise(40));
        assert_eq!("kd31".parse::<KRef>().unwrap(), KRef::Device(31));
        assert!("ko".parse::<KRef>().is_err());
        assert!("ko020".parse::<KRef>().is_err());
        assert!("kx1".parse::<KRef>().is_err());
    }

    #[test]
    fn test_vref_string_forms() {
        for s in ["o+0", "o-50", "p+3", "p-60", "d+0", "d-70", "o+v12/3", "o+d4/1"] {
            let vref: VRef = s.parse().unwrap();
            assert_eq!(vref.to_string(), s);
        }
        assert!("o-v1/2".parse::<VRef>().is_err());
        assert!("p+d1/2".parse::<VRef>().is_err());
        assert!("q+1".parse::<VRef>().is_err());
        assert!("o*1".parse::<VRef>().is_err());
    }

    #[test]
    fn test_vref_upgrade_survival() {
        assert!(VRef::root().survives_upgrade());
        assert!(VRef::durable_object(3, 1).survives_upgrade());
        assert!(!VRef::virtual_object(3, 1).survives_upgrade());
        assert!(!VRef::object_export(5).survives_upgrade());
    }

    #[test]
    fn test_participant_parse() {
        assert_eq!("v3".parse::<Participant>().unwrap(), Participant::Vat(VatId(3)));
        assert_eq!(
            "d7".parse::<Participant>().unwrap(),
            Participant::Device(DeviceId(7))
        );
    }

    #[test]
    fn test_refcount_pair() {
        let rc = RefCounts::new(1, 2);
        assert_eq!(rc.to_string(), "1,2");
        assert_eq!("1,2".parse::<RefCounts>().unwrap(), rc);
        assert!("2,1".parse::<RefCounts>().is_err());
    }

    #[test]
    fn test_refs_serialize_as_strings() {
        let msg = Message::new(
            CapData::new("#[]", vec![KRef::Object(20)]),
            Some(KRef::Promise(41)),
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r##"{"methargs":{"body":"#[]","slots":["ko20"]},"result":"kp41"}"##
        );
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_kernel_error_body() {
        assert_eq!(
            kernel_error(VAT_TERMINATED).body,
            r##"#{"#error":"vat terminated","name":"Error"}"##
        );
        assert_eq!(
            upgrade_disconnection("bye", 2).body,
            r##"#{"incarnationNumber":2,"name":"vatUpgraded","upgradeMessage":"bye"}"##
        );
    }
}
