//! Fieldmap classification
//!
//! Series translated into `fmap` are classified by a single pure function,
//! then grouped per acquisition so the canonical contrast (`magnitude1`,
//! `magnitude2`, `phasediff`, `phase1`, `phase2`, `epi`) can be chosen and
//! duplicates flagged. Only authoritative members of a group are used for
//! Intended-For linkage.
//!
//! A GRE set stored as two separate phase images is recognised by its echo-1
//! phase member: the group's phase images become `phase1`/`phase2` and keep
//! their own `EchoTime`. Such a group never yields a `phasediff`.

use crate::scanner::ConvertedSeries;
use sdk::entities::Stub;
use std::collections::BTreeMap;
use std::fmt;

/// Role of one series within a fieldmap acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldmapRole {
    Magnitude1,
    Magnitude2,
    PhaseDifference,
    /// Phase image of the first echo
    Phase1,
    /// Phase image of the second echo, when paired with a [`FieldmapRole::Phase1`]
    Phase2,
    DirectionAP,
    DirectionPA,
    NotAFieldmap,
}

impl FieldmapRole {
    /// Canonical contrast suffix for this role.
    pub fn contrast(&self) -> Option<&'static str> {
        match self {
            Self::Magnitude1 => Some("magnitude1"),
            Self::Magnitude2 => Some("magnitude2"),
            Self::PhaseDifference => Some("phasediff"),
            Self::Phase1 => Some("phase1"),
            Self::Phase2 => Some("phase2"),
            Self::DirectionAP | Self::DirectionPA => Some("epi"),
            Self::NotAFieldmap => None,
        }
    }

    /// Phase-encoding direction label for EPI roles.
    pub fn direction(&self) -> Option<&'static str> {
        match self {
            Self::DirectionAP => Some("AP"),
            Self::DirectionPA => Some("PA"),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Magnitude1 => "magnitude1",
            Self::Magnitude2 => "magnitude2",
            Self::PhaseDifference => "phasediff",
            Self::Phase1 => "phase1",
            Self::Phase2 => "phase2",
            Self::DirectionAP => "epi-AP",
            Self::DirectionPA => "epi-PA",
            Self::NotAFieldmap => "unclassified",
        }
    }
}

impl fmt::Display for FieldmapRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify one series.
///
/// Rules, first match wins:
/// 1. recon suffix ending in `ph`: echo 1 is [`FieldmapRole::Phase1`], echo 2
///    or no echo index the phase difference
/// 2. `ImageType` containing `P`/`PHASE`: the same split on the echo number
/// 3. recon `e1`/`e2`, or magnitude `ImageType` with `EchoNumber` 1/2
/// 4. EPI with `PhaseEncodingDirection` `j-` (AP) or `j` (PA)
/// 5. `AP`/`PA` tokens in the protocol name
pub fn classify(series: &ConvertedSeries) -> FieldmapRole {
    let meta = &series.metadata;
    let echo = series.file_name.recon_echo().or_else(|| meta.echo_number());
    let image_type = meta.image_type();

    if series.file_name.is_phase_recon() {
        return match echo {
            Some(1) => FieldmapRole::Phase1,
            Some(2) | None => FieldmapRole::PhaseDifference,
            _ => FieldmapRole::NotAFieldmap,
        };
    }

    if image_type.iter().any(|t| t == "P" || t == "PHASE") {
        return match echo {
            Some(1) => FieldmapRole::Phase1,
            _ => FieldmapRole::PhaseDifference,
        };
    }

    let magnitude = image_type.iter().any(|t| t == "M" || t == "MAGNITUDE");
    match (series.file_name.recon_echo(), magnitude, meta.echo_number()) {
        (Some(1), _, _) | (None, true, Some(1)) => return FieldmapRole::Magnitude1,
        (Some(2), _, _) | (None, true, Some(2)) => return FieldmapRole::Magnitude2,
        _ => {}
    }

    let is_epi = meta
        .scanning_sequence()
        .is_some_and(|s| s.to_uppercase().contains("EP"));
    if is_epi {
        match meta.phase_encoding_direction() {
            Some("j-") => return FieldmapRole::DirectionAP,
            Some("j") => return FieldmapRole::DirectionPA,
            _ => {}
        }
    }

    for token in series
        .protocol
        .split(|c: char| c == '_' || c == '-' || c.is_whitespace())
    {
        if token.eq_ignore_ascii_case("AP") {
            return FieldmapRole::DirectionAP;
        }
        if token.eq_ignore_ascii_case("PA") {
            return FieldmapRole::DirectionPA;
        }
    }

    FieldmapRole::NotAFieldmap
}

/// Whether a classified member is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleStatus {
    /// First series in acquisition order with this role
    Authoritative,
    /// Same role as an earlier series in the group; flagged for review
    Duplicate { kept_ordinal: usize },
    /// No role could be determined, or the group it belongs to is incomplete
    Unclassified,
}

/// Classification result for one series.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldmapVerdict {
    pub ordinal: usize,
    pub role: FieldmapRole,
    pub status: RoleStatus,
    pub echo_time: Option<f64>,
}

impl FieldmapVerdict {
    pub fn is_linkable(&self) -> bool {
        self.status == RoleStatus::Authoritative
    }

    /// Canonical stub for this series given the translator stub.
    ///
    /// Authoritative members take their role contrast; a `dir-` the user wrote
    /// into the stub wins over the detected direction. Everything else keeps
    /// the translator stub, with `_fieldmap` appended when it has no contrast.
    pub fn stub(&self, translator_stub: &Stub) -> Stub {
        let mut stub = translator_stub.clone();
        match (self.status, self.role) {
            (RoleStatus::Authoritative, FieldmapRole::DirectionAP | FieldmapRole::DirectionPA) => {
                if stub.entity("dir").is_none() {
                    if let Some(dir) = self.role.direction() {
                        stub.set("dir", dir);
                    }
                }
                if stub.suffix().is_none() {
                    stub.set_suffix("epi");
                }
            }
            (RoleStatus::Authoritative, role) => {
                if let Some(contrast) = role.contrast() {
                    stub.set_suffix(contrast);
                }
            }
            _ => {
                if stub.suffix().is_none() {
                    stub.set_suffix("fieldmap");
                }
            }
        }
        stub
    }

    /// Review message for non-authoritative members.
    pub fn review_note(&self, protocol: &str) -> Option<String> {
        match self.status {
            RoleStatus::Authoritative => None,
            RoleStatus::Duplicate { kept_ordinal } => Some(format!(
                "fieldmap '{}' (series #{}) duplicates role {} of series #{}; placed under a neutral name for review",
                protocol, self.ordinal, self.role, kept_ordinal
            )),
            RoleStatus::Unclassified => Some(format!(
                "fieldmap '{}' (series #{}) could not be classified; placed under a neutral name for review",
                protocol, self.ordinal
            )),
        }
    }
}

/// Echo times written into a phase-difference sidecar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EchoTimes {
    pub echo_time1: f64,
    pub echo_time2: f64,
}

/// Series of one fieldmap acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldmapGroup {
    pub protocol: String,
    pub base_series: u32,
    pub members: Vec<FieldmapVerdict>,
}

impl FieldmapGroup {
    /// Authoritative member with the given role.
    pub fn authoritative(&self, role: FieldmapRole) -> Option<&FieldmapVerdict> {
        self.members
            .iter()
            .find(|m| m.role == role && m.is_linkable())
    }

    /// `EchoTime1`/`EchoTime2` for the phase difference of this group.
    ///
    /// `Ok(None)` when the group has no phase difference; `Err` with a
    /// warning when the magnitude or an echo time is missing. For a
    /// `phase1`/`phase2` pair each image keeps its own `EchoTime`, so only
    /// its presence is checked.
    pub fn echo_times(&self) -> Result<Option<EchoTimes>, String> {
        if let Some(phase1) = self.authoritative(FieldmapRole::Phase1) {
            let phase2 = self.authoritative(FieldmapRole::Phase2);
            return match (phase1.echo_time, phase2.and_then(|p| p.echo_time)) {
                (Some(_), Some(_)) => Ok(None),
                _ => Err(format!(
                    "phase1/phase2 '{}' (series {}) is missing EchoTime on a phase image",
                    self.protocol, self.base_series
                )),
            };
        }
        let Some(phase) = self.authoritative(FieldmapRole::PhaseDifference) else {
            return Ok(None);
        };
        let magnitude = self.authoritative(FieldmapRole::Magnitude1).ok_or_else(|| {
            format!(
                "phasediff '{}' (series {}) has no magnitude1; echo times not set",
                self.protocol, self.base_series
            )
        })?;
        match (magnitude.echo_time, phase.echo_time) {
            (Some(echo_time1), Some(echo_time2)) => Ok(Some(EchoTimes {
                echo_time1,
                echo_time2,
            })),
            _ => Err(format!(
                "phasediff '{}' (series {}) is missing EchoTime on magnitude or phase; echo times not set",
                self.protocol, self.base_series
            )),
        }
    }
}

/// Classify and group the fieldmap series of one session.
///
/// Members sharing a protocol and base series number form a group; a phase
/// series whose series number minus one holds a magnitude of the same
/// protocol joins that magnitude's group. Groups come back in acquisition order.
///
/// In a group with an echo-1 phase image the remaining phase images are
/// `phase2`. An echo-1 phase image without a partner leaves the whole group
/// unclassified.
pub fn group_fieldmaps(series: &[&ConvertedSeries]) -> Vec<FieldmapGroup> {
    let classified: Vec<(&ConvertedSeries, FieldmapRole)> =
        series.iter().map(|s| (*s, classify(s))).collect();

    let is_magnitude = |protocol: &str, number: u32| {
        classified.iter().any(|(s, role)| {
            s.protocol == protocol
                && s.file_name.series_number == number
                && matches!(role, FieldmapRole::Magnitude1 | FieldmapRole::Magnitude2)
        })
    };

    let mut groups: BTreeMap<(String, u32), Vec<(&ConvertedSeries, FieldmapRole)>> =
        BTreeMap::new();
    for (s, role) in &classified {
        let number = s.file_name.series_number;
        let is_phase = matches!(role, FieldmapRole::PhaseDifference | FieldmapRole::Phase1);
        let base = if is_phase
            && number > 0
            && is_magnitude(&s.protocol, number - 1)
        {
            number - 1
        } else {
            number
        };
        groups
            .entry((s.protocol.clone(), base))
            .or_default()
            .push((*s, *role));
    }

    let mut result: Vec<FieldmapGroup> = groups
        .into_iter()
        .map(|((protocol, base_series), mut members)| {
            members.sort_by_key(|(s, _)| s.ordinal);

            let separate_phases = members.iter().any(|(_, r)| *r == FieldmapRole::Phase1);
            let mut incomplete = false;
            if separate_phases {
                for (_, role) in members.iter_mut() {
                    if *role == FieldmapRole::PhaseDifference {
                        *role = FieldmapRole::Phase2;
                    }
                }
                incomplete = !members.iter().any(|(_, r)| *r == FieldmapRole::Phase2);
            }

            let mut kept: BTreeMap<FieldmapRole, usize> = BTreeMap::new();
            let members = members
                .into_iter()
                .map(|(s, role)| {
                    let status = if incomplete || role == FieldmapRole::NotAFieldmap {
                        RoleStatus::Unclassified
                    } else if let Some(&kept_ordinal) = kept.get(&role) {
                        RoleStatus::Duplicate { kept_ordinal }
                    } else {
                        kept.insert(role, s.ordinal);
                        RoleStatus::Authoritative
                    };
                    FieldmapVerdict {
                        ordinal: s.ordinal,
                        role,
                        status,
                        echo_time: s.metadata.echo_time(),
                    }
                })
                .collect();
            FieldmapGroup {
                protocol,
                base_series,
                members,
            }
        })
        .collect();

    result.sort_by_key(|g| g.members.first().map(|m| m.ordinal));
    result
}
