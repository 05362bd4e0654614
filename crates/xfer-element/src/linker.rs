//! The cost-optimizing linker: given an ordered chain of elements (a source,
//! zero or more filters, and a destination), finds the cheapest way to wire
//! each adjacent pair together, inserting [`Glue`] where no mechanism pair
//! already matches.
//!
//! Mechanism matching is pure equality between a neighbor's chosen output
//! mechanism and the next element's chosen input mechanism -- this also
//! covers the direct-TCP case, where a `DirectTcpListen`-tagged source
//! paired with a `DirectTcpListen`-tagged destination is a valid chain
//! (the tag names which side's address is authoritative, not which side
//! calls `listen(2)`), and Glue never participates since it has no
//! `DirectTcpListen`/`DirectTcpConnect` entries in its own mechanism table.

use crate::element::{ElementArc, XferElement};
use crate::error::ElementError;
use crate::glue::Glue;
use crate::mechanism::{MechPair, Mechanism};

/// One link in a negotiated chain: either one of the caller's original
/// elements, or a [`Glue`] element the linker inserted between two of them.
#[derive(Clone)]
enum Placed {
    Original(ElementArc, MechPair),
    Glue(ElementArc, MechPair),
}

impl Placed {
    fn element(&self) -> &ElementArc {
        match self {
            Self::Original(element, _) | Self::Glue(element, _) => element,
        }
    }

    fn pair(&self) -> MechPair {
        match self {
            Self::Original(_, pair) | Self::Glue(_, pair) => *pair,
        }
    }
}

/// Negotiates mechanisms for an ordered chain of elements and wires their
/// neighbor links, inserting glue elements as needed.
///
/// `elements` must be given source-first, destination-last; every interior
/// element must advertise at least one mechanism pair compatible (directly,
/// or via glue) with its neighbors.
pub struct Linker;

impl Linker {
    /// Finds the lowest-cost mechanism chain linking `elements` end to end,
    /// returning the final element sequence (with any inserted glue) in
    /// pipeline order, with every element's mechanisms and neighbor links
    /// already set.
    ///
    /// # Errors
    ///
    /// Returns [`ElementError::Configuration`] if no chain exists linking
    /// every element from the source's fixed output through to the
    /// destination's fixed input.
    pub fn link(elements: Vec<ElementArc>) -> Result<Vec<ElementArc>, ElementError> {
        if elements.len() < 2 {
            return Err(ElementError::Configuration(
                "a transfer chain needs at least a source and a destination".to_string(),
            ));
        }

        let best = search(&elements, 0, Mechanism::None)
            .ok_or_else(|| ElementError::Configuration("no mechanism chain links this element sequence".to_string()))?;

        let chain: Vec<ElementArc> = best.1.iter().map(Placed::element).cloned().collect();
        wire(&chain);
        Ok(chain)
    }
}

/// Depth-first search over every legal placement at `index`, and (when no
/// direct match exists) every glue bridge, returning the lowest-cost
/// `(total_cost, placements)` completing the chain from `index` onward given
/// that the previous element's output mechanism was `prev_output`.
///
/// Chains here are short (a handful of elements, each with a handful of
/// mechanism pair options), so an exhaustive search is cheap; this is not
/// meant to scale to large pipelines.
fn search(elements: &[ElementArc], index: usize, prev_output: Mechanism) -> Option<(u64, Vec<Placed>)> {
    if index == elements.len() {
        return Some((0, Vec::new()));
    }

    let element = &elements[index];
    let is_last = index + 1 == elements.len();
    let mut best: Option<(u64, Vec<Placed>)> = None;

    for &pair in element.mech_pairs() {
        if pair.input != prev_output {
            continue;
        }
        if is_last && pair.output != Mechanism::None {
            continue;
        }
        let Some((rest_cost, rest)) = search(elements, index + 1, pair.output) else {
            continue;
        };
        let total = u64::from(pair.cost()) + rest_cost;
        if best.as_ref().is_none_or(|(cost, _)| total < *cost) {
            let mut placements = vec![Placed::Original(ElementArc::clone(element), pair)];
            placements.extend(rest);
            best = Some((total, placements));
        }
    }

    if index > 0 {
        for &glue_pair in crate::glue::MECH_PAIRS {
            if glue_pair.input != prev_output {
                continue;
            }
            let Ok(glue) = Glue::new(glue_pair.input, glue_pair.output) else {
                continue;
            };
            for &pair in element.mech_pairs() {
                if pair.input != glue_pair.output {
                    continue;
                }
                if is_last && pair.output != Mechanism::None {
                    continue;
                }
                let Some((rest_cost, rest)) = search(elements, index + 1, pair.output) else {
                    continue;
                };
                let total = u64::from(glue_pair.cost()) + u64::from(pair.cost()) + rest_cost;
                if best.as_ref().is_none_or(|(cost, _)| total < *cost) {
                    let mut placements = vec![
                        Placed::Glue(ElementArc::clone(&glue), glue_pair),
                        Placed::Original(ElementArc::clone(element), pair),
                    ];
                    placements.extend(rest);
                    best = Some((total, placements));
                }
            }
        }
    }

    best
}

fn wire(chain: &[ElementArc]) {
    for (index, element) in chain.iter().enumerate() {
        let upstream = index.checked_sub(1).map(|i| &chain[i]);
        let downstream = chain.get(index + 1);
        element.core().set_neighbors(upstream, downstream);
    }
}

#[cfg(test)]
mod tests {
    use super::Linker;
    use crate::dest::FdDest;
    use crate::filter::XorFilter;
    use crate::mechanism::Mechanism;
    use crate::source::FdSource;

    #[test]
    fn links_source_filter_dest_directly_when_mechanisms_already_match() {
        #[allow(unsafe_code)]
        let source = FdSource::new(unsafe { libc::dup(0) }).expect("dup stdin");
        let filter = XorFilter::new(0x11);
        #[allow(unsafe_code)]
        let dest = FdDest::new(unsafe { libc::dup(1) }).expect("dup stdout");

        let chain = Linker::link(vec![source, filter, dest]).expect("chain must link");
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[1].core().mechs(), (Mechanism::ReadFd, Mechanism::WriteFd));
    }

    #[test]
    fn inserts_glue_between_incompatible_neighbors() {
        use crate::dest::FdDest;
        use crate::source::RandomSource;

        let source = RandomSource::new(16, 1);
        #[allow(unsafe_code)]
        let dest = FdDest::new(unsafe { libc::dup(1) }).expect("dup stdout");

        let chain = Linker::link(vec![source, dest]).expect("chain must link via glue");
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[1].core().kind_name(), "glue");
    }

    #[test]
    fn fails_when_no_chain_exists() {
        use crate::dest::DirectTcpConnectDest;
        use crate::source::RandomSource;
        use std::net::SocketAddr;

        let source = RandomSource::new(16, 1);
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let dest = DirectTcpConnectDest::new(vec![addr]);

        assert!(Linker::link(vec![source, dest]).is_err());
    }
}
