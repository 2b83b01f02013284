//! Section classification: every section gets exactly one privilege label,
//! and the loaded ones become an address-range lookup.

use tracing::{debug, info, info_span, warn};

use crate::model::{Anomaly, PrivilegeLevel, RawSection, Section, SectionId};
use crate::policy::PrivilegePolicy;
use crate::ranges::{RangeIndex, RangeIndexBuilder};

/// Classified sections plus an address-range index over the loaded ones.
#[derive(Debug, Clone)]
pub struct PrivilegeMap {
    sections: Vec<Section>,
    index: RangeIndex<SectionId>,
    anomalies: Vec<Anomaly>,
}

impl PrivilegeMap {
    /// Privilege of the section owning `address`, `Unknown` outside all sections.
    pub fn level_at(&self, address: u64) -> PrivilegeLevel {
        self.section_at(address).map(|s| s.privilege).unwrap_or(PrivilegeLevel::Unknown)
    }

    pub fn section_at(&self, address: u64) -> Option<&Section> {
        self.index.lookup(address).and_then(|id| self.section(id))
    }

    /// End of the range `address` belongs to, which is where the owning
    /// section stops owning addresses (an earlier overlapping section may
    /// cut it short).
    pub fn owned_end(&self, address: u64) -> Option<u64> {
        self.index.entry(address).map(|e| e.end)
    }

    pub fn section(&self, id: SectionId) -> Option<&Section> {
        self.sections.get(id.0)
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    pub fn count(&self, level: PrivilegeLevel) -> usize {
        self.sections.iter().filter(|s| s.privilege == level).count()
    }
}

pub struct SectionClassifier<'a> {
    policy: &'a PrivilegePolicy,
}

impl<'a> SectionClassifier<'a> {
    pub fn new(policy: &'a PrivilegePolicy) -> Self {
        Self { policy }
    }

    /// Label every section and build the range index.
    ///
    /// Overlapping ranges are resolved in favour of the section declared
    /// first. Only allocatable, non-empty sections take part in address
    /// lookups; the rest are still labelled and reported.
    pub fn classify(&self, raw: &[RawSection]) -> PrivilegeMap {
        let _span = info_span!("classify_sections", count = raw.len()).entered();

        let mut anomalies = Vec::new();
        let sections: Vec<Section> = raw
            .iter()
            .enumerate()
            .map(|(idx, rs)| Section {
                id: SectionId(idx),
                name: rs.name.clone(),
                address: rs.address,
                size: rs.size,
                flags: rs.flags,
                privilege: self.policy.section_level(&rs.name, rs.flags.executable),
            })
            .collect();

        for section in sections.iter().filter(|s| s.flags.executable) {
            if section.privilege == PrivilegeLevel::Unknown {
                warn!(section = %section.name, "executable section left unclassified");
                anomalies.push(Anomaly::UnclassifiedSection {
                    section: section.name.clone(),
                    address: section.address,
                });
            }
        }

        let mut builder = RangeIndexBuilder::new();
        for section in sections.iter().filter(|s| s.flags.allocatable && s.size > 0) {
            for conflict in builder.claim(section.address, section.end(), section.id) {
                let owner = &sections[conflict.owner.0];
                if owner.flags.executable && section.flags.executable {
                    warn!(
                        kept = %owner.name,
                        overlapped = %section.name,
                        start = conflict.start,
                        end = conflict.end,
                        "overlapping executable sections"
                    );
                    anomalies.push(Anomaly::OverlappingSections {
                        kept: owner.name.clone(),
                        overlapped: section.name.clone(),
                        start: conflict.start,
                        end: conflict.end,
                    });
                } else {
                    debug!(kept = %owner.name, overlapped = %section.name, "sections overlap");
                }
            }
        }

        let map = PrivilegeMap { index: builder.build(), sections, anomalies };
        info!(
            privileged = map.count(PrivilegeLevel::Privileged),
            unprivileged = map.count(PrivilegeLevel::Unprivileged),
            gate = map.count(PrivilegeLevel::Gate),
            unknown = map.count(PrivilegeLevel::Unknown),
            "sections classified"
        );
        map
    }
}
