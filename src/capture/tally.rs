use std::collections::BTreeMap;

use crate::faction::FactionRegistry;
use crate::types::{EntityId, FactionIndex, Occupant, TallyResult};

#[derive(Clone, Copy, Debug)]
pub struct TallyRules {
    pub ignore_non_playable_attackers: bool,
    pub ignore_non_playable_defenders: bool,
    pub max_seizing_characters: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tally {
    pub result: TallyResult,
    pub presence: BTreeMap<FactionIndex, u32>,
    pub despawn: Vec<EntityId>,
}

pub fn tally_occupants(
    occupants: &[Occupant],
    factions: &FactionRegistry,
    rules: TallyRules,
) -> Tally {
    let mut presence: BTreeMap<FactionIndex, u32> = BTreeMap::new();
    let mut despawn = Vec::new();
    for occupant in occupants {
        if occupant.disabled_ai {
            despawn.push(occupant.entity);
            continue;
        }
        if !occupant.alive {
            continue;
        }
        let Some(faction) = occupant.faction else {
            continue;
        };
        if factions.get(faction).is_none() {
            continue;
        }
        *presence.entry(faction).or_insert(0) += 1;
    }

    let mut candidate: Option<FactionIndex> = None;
    let mut attacking = 0u32;
    for (faction, count) in &presence {
        if rules.ignore_non_playable_attackers && !factions.is_playable(*faction) {
            continue;
        }
        if *count > attacking {
            attacking = *count;
            candidate = Some(*faction);
        } else if *count == attacking {
            candidate = None;
        }
    }

    let mut result = TallyResult::NONE;
    if let Some(prevailing) = candidate {
        let defending = presence
            .iter()
            .filter(|(faction, _)| **faction != prevailing)
            .filter(|(faction, _)| {
                !rules.ignore_non_playable_defenders || factions.is_playable(**faction)
            })
            .map(|(_, count)| *count)
            .max()
            .unwrap_or(0);

        if attacking > defending {
            result = TallyResult {
                prevailing: Some(prevailing),
                seizing: (attacking - defending).min(rules.max_seizing_characters),
            };
        }
    }

    Tally {
        result,
        presence,
        despawn,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::faction::Faction;

    const US: FactionIndex = FactionIndex(0);
    const USSR: FactionIndex = FactionIndex(1);
    const FIA: FactionIndex = FactionIndex(2);

    fn registry() -> FactionRegistry {
        FactionRegistry::new(vec![
            Faction::new("US", true, "us-net"),
            Faction::new("USSR", true, "ussr-net"),
            Faction::new("FIA", false, "fia-net"),
        ])
    }

    fn rules(cap: u32) -> TallyRules {
        TallyRules {
            ignore_non_playable_attackers: true,
            ignore_non_playable_defenders: false,
            max_seizing_characters: cap,
        }
    }

    fn crowd(groups: &[(FactionIndex, u32)]) -> Vec<Occupant> {
        let mut next = 0u64;
        let mut occupants = Vec::new();
        for (faction, count) in groups {
            for _ in 0..*count {
                next += 1;
                occupants.push(Occupant::soldier(EntityId(next), *faction));
            }
        }
        occupants
    }

    #[test]
    fn net_advantage_is_capped() {
        let tally = tally_occupants(&crowd(&[(US, 1), (USSR, 5)]), &registry(), rules(3));
        assert_eq!(tally.result.prevailing, Some(USSR));
        assert_eq!(tally.result.seizing, 3);
        assert_eq!(tally.presence.get(&USSR), Some(&5));
    }

    #[test]
    fn tie_for_top_has_no_prevailing_faction() {
        let tally = tally_occupants(
            &crowd(&[(US, 3), (USSR, 3), (FIA, 1)]),
            &registry(),
            rules(8),
        );
        assert_eq!(tally.result, TallyResult::NONE);
    }

    #[test]
    fn higher_count_after_tie_restores_candidate() {
        let registry = FactionRegistry::new(vec![
            Faction::new("A", true, ""),
            Faction::new("B", true, ""),
            Faction::new("C", true, ""),
        ]);
        let tally = tally_occupants(
            &crowd(&[(FactionIndex(0), 2), (FactionIndex(1), 2), (FactionIndex(2), 4)]),
            &registry,
            rules(8),
        );
        assert_eq!(tally.result.prevailing, Some(FactionIndex(2)));
        assert_eq!(tally.result.seizing, 2);
    }

    #[test]
    fn non_playable_attackers_are_ignored_but_still_defend() {
        let tally = tally_occupants(&crowd(&[(FIA, 6), (US, 4)]), &registry(), rules(8));
        assert_eq!(tally.result, TallyResult::NONE);

        let tally = tally_occupants(&crowd(&[(FIA, 2), (US, 4)]), &registry(), rules(8));
        assert_eq!(tally.result.prevailing, Some(US));
        assert_eq!(tally.result.seizing, 2);
    }

    #[test]
    fn non_playable_defenders_can_be_ignored_independently() {
        let rules = TallyRules {
            ignore_non_playable_defenders: true,
            ..rules(8)
        };
        let tally = tally_occupants(&crowd(&[(FIA, 2), (US, 4)]), &registry(), rules);
        assert_eq!(tally.result.seizing, 4);
    }

    #[test]
    fn dead_unaffiliated_and_unknown_occupants_are_skipped() {
        let mut occupants = crowd(&[(USSR, 2)]);
        occupants.push(Occupant {
            entity: EntityId(100),
            faction: Some(US),
            alive: false,
            disabled_ai: false,
        });
        occupants.push(Occupant {
            entity: EntityId(101),
            faction: None,
            alive: true,
            disabled_ai: false,
        });
        occupants.push(Occupant::soldier(EntityId(102), FactionIndex(40)));

        let tally = tally_occupants(&occupants, &registry(), rules(8));
        assert_eq!(tally.presence.len(), 1);
        assert_eq!(tally.result.prevailing, Some(USSR));
        assert_eq!(tally.result.seizing, 2);
        assert!(tally.despawn.is_empty());
    }

    #[test]
    fn disabled_ai_is_despawned_and_not_counted() {
        let mut occupants = crowd(&[(USSR, 1), (US, 1)]);
        occupants.push(Occupant {
            entity: EntityId(77),
            faction: Some(USSR),
            alive: true,
            disabled_ai: true,
        });
        let tally = tally_occupants(&occupants, &registry(), rules(8));
        assert_eq!(tally.despawn, vec![EntityId(77)]);
        assert_eq!(tally.result, TallyResult::NONE);
    }

    #[test]
    fn empty_zone_has_no_candidate() {
        let tally = tally_occupants(&[], &registry(), rules(8));
        assert_eq!(tally.result, TallyResult::NONE);
    }

    proptest! {
        #[test]
        fn prop_tied_leaders_never_prevail(top in 1u32..12, others in proptest::collection::vec(0u32..12, 0..3), cap in 0u32..10) {
            let registry = FactionRegistry::new(vec![
                Faction::new("A", true, ""),
                Faction::new("B", true, ""),
                Faction::new("C", true, ""),
                Faction::new("D", true, ""),
                Faction::new("E", true, ""),
            ]);
            let mut groups = vec![(FactionIndex(0), top), (FactionIndex(1), top)];
            for (offset, count) in others.iter().enumerate() {
                groups.push((FactionIndex(2 + offset), (*count).min(top - 1)));
            }
            let tally = tally_occupants(&crowd(&groups), &registry, rules(cap));
            prop_assert_eq!(tally.result, TallyResult::NONE);
        }

        #[test]
        fn prop_seizing_count_respects_cap(us in 0u32..20, ussr in 0u32..20, cap in 0u32..10) {
            let tally = tally_occupants(&crowd(&[(US, us), (USSR, ussr)]), &registry(), rules(cap));
            prop_assert!(tally.result.seizing <= cap);
            if tally.result.prevailing.is_none() {
                prop_assert_eq!(tally.result.seizing, 0);
            }
        }
    }
}
