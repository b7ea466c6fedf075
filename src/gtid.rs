//! Global transaction identifiers: the pair (epoch uuid, seqno) assigned by
//! the replication provider. The seqno increases by exactly 1 for every
//! totally ordered event (write-set or membership change) within an epoch.

use crate::errdata;
use crate::error::{Error, Result};

use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

/// A sequence number within a GTID epoch.
pub type Seqno = i64;

/// The undefined seqno, used before a node has any state.
pub const SEQNO_UNDEFINED: Seqno = -1;

/// A global transaction ID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gtid {
    /// The epoch uuid, established when a cluster is bootstrapped.
    pub uuid: Uuid,
    /// The sequence number within the epoch.
    pub seqno: Seqno,
}

impl Gtid {
    /// The undefined GTID: nil uuid, seqno -1.
    pub const UNDEFINED: Gtid = Gtid { uuid: Uuid::nil(), seqno: SEQNO_UNDEFINED };

    pub fn new(uuid: Uuid, seqno: Seqno) -> Self {
        Self { uuid, seqno }
    }

    /// Returns true if this is the undefined GTID. A nil uuid with a valid
    /// seqno (or vice versa) is not undefined.
    pub fn is_undefined(&self) -> bool {
        *self == Self::UNDEFINED
    }
}

impl std::fmt::Display for Gtid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.uuid, self.seqno)
    }
}

impl std::str::FromStr for Gtid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // The uuid itself contains no ':', so split at the first one.
        let Some((uuid, seqno)) = s.split_once(':') else {
            return errdata!("no seqno in GTID {s}");
        };
        let uuid = Uuid::parse_str(uuid).map_err(|e| Error::InvalidData(e.to_string()))?;
        let seqno = seqno.parse().map_err(|_| Error::InvalidData(format!("bad seqno {seqno}")))?;
        Ok(Gtid { uuid, seqno })
    }
}
