use super::config::{Measure, Provide, ResourceMap};
use crate::types::Payload;

/// The dispatch tier of a resource. Fetches are initiated tier by tier, in declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    Critical,
    Noncritical,
    Prefetch,
}

/// A single resource of a plan, with prefetches expanded into their own descriptors.
#[derive(Clone, Debug)]
pub(crate) struct Descriptor {
    pub name: String,
    pub tier: Tier,
    pub model_key: String,
    pub payload: Payload,
    pub depends_on: Vec<String>,
    pub provides: Vec<Provide>,
    pub force_fetch: bool,
    pub lazy: bool,
    pub listen: bool,
    pub measure: Measure,
}

impl Descriptor {
    /// Returns the first dependency without a non-null value in the merged payload.
    pub fn unmet_dependency(&self) -> Option<&str> {
        let merged = self.payload.merged();
        self.depends_on
            .iter()
            .find(|field| !merged.contains_key(field.as_str()))
            .map(String::as_str)
    }
}

/// Expands a resource map into descriptors, ordered by tier.
///
/// Every prefetch becomes a descriptor named `<parent>.prefetch.<index>`, with the parent's
/// payload overlaid by the prefetch's partial payload. Prefetches never provide values and never
/// listen for changes.
pub(crate) fn expand(resources: ResourceMap) -> Vec<Descriptor> {
    let mut descriptors = Vec::with_capacity(resources.len());

    for (name, config) in resources {
        let model_key = config.model_key.unwrap_or_else(|| name.clone());
        let tier = if config.critical {
            Tier::Critical
        } else {
            Tier::Noncritical
        };

        for (index, partial) in config.prefetches.iter().enumerate() {
            descriptors.push(Descriptor {
                name: format!("{name}.prefetch.{index}"),
                tier: Tier::Prefetch,
                model_key: model_key.clone(),
                payload: config.payload.overlay(partial),
                depends_on: config.depends_on.clone(),
                provides: Vec::new(),
                force_fetch: config.force_fetch,
                lazy: false,
                listen: false,
                measure: config.measure.clone(),
            });
        }

        descriptors.push(Descriptor {
            name,
            tier,
            model_key,
            payload: config.payload,
            depends_on: config.depends_on,
            provides: config.provides,
            force_fetch: config.force_fetch,
            lazy: config.lazy,
            listen: config.listen,
            measure: config.measure,
        });
    }

    // stable, so declaration order is kept within a tier
    descriptors.sort_by_key(|descriptor| descriptor.tier);
    descriptors
}
