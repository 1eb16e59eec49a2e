use crate::CoreError;
use serde::Serialize;
use std::fmt;
use stratum_host::{Permission, VolumeAttributes};
use stratum_schema::ImageKind;

/// Where one element of a base/layer chain stands.
///
/// Bases go `Absent -> BaseCreated -> BaseLocked`. Layers go
/// `Absent -> Snapshotting -> Activated -> Superseded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChainState {
    Absent,
    BaseCreated,
    BaseLocked,
    Snapshotting,
    Activated,
    Superseded,
}

impl ChainState {
    /// Classify live volume attributes.
    ///
    /// A layer is only `Superseded` once a newer layer exists on its base;
    /// without one, a layer still flagged to skip activation was left behind
    /// by an interrupted `add_bootable_layer`.
    pub fn observe(kind: ImageKind, attrs: &VolumeAttributes, has_successor: bool) -> Self {
        match kind {
            ImageKind::Base => {
                if attrs.permission == Permission::ReadOnly && attrs.activation_skip {
                    ChainState::BaseLocked
                } else {
                    ChainState::BaseCreated
                }
            }
            ImageKind::Layer => match (attrs.activation_skip, has_successor) {
                (false, _) => ChainState::Activated,
                (true, true) => ChainState::Superseded,
                (true, false) => ChainState::Snapshotting,
            },
        }
    }

    /// True for the states an operation ends in.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            ChainState::BaseLocked | ChainState::Activated | ChainState::Superseded
        )
    }
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChainState::Absent => "absent",
            ChainState::BaseCreated => "base-created",
            ChainState::BaseLocked => "base-locked",
            ChainState::Snapshotting => "snapshotting",
            ChainState::Activated => "activated",
            ChainState::Superseded => "superseded",
        };
        f.write_str(s)
    }
}

pub fn validate_transition(from: ChainState, to: ChainState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (ChainState::Absent, ChainState::BaseCreated | ChainState::Snapshotting)
            | (ChainState::BaseCreated, ChainState::BaseLocked)
            | (ChainState::Snapshotting, ChainState::Activated)
            | (ChainState::Activated, ChainState::Superseded)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
