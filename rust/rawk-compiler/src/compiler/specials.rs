//! The fixed set of built-in ("special") variables.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Special variables are addressed by this closed enumeration and never occupy
/// global scalar slots.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::IntoStaticStr,
    strum::EnumIter,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum SpecialVar {
    Argc,
    Convfmt,
    Filename,
    Fnr,
    Fs,
    Nf,
    Nr,
    Ofmt,
    Ofs,
    Ors,
    Rlength,
    Rs,
    Rstart,
    Rt,
    Subsep,
}

impl SpecialVar {
    pub fn from_name(name: &str) -> Option<Self> {
        SpecialVar::from_str(name).ok()
    }

    pub fn name(self) -> &'static str {
        self.into()
    }

    /// 1-based index, stable across releases.
    pub fn index(self) -> usize {
        self as usize + 1
    }
}
