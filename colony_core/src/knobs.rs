/// Identifier of one tunable weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnobId(usize);

/// Room for every registered knob, with a little headroom.
const NUM_KNOBS: usize = 16;

/// Knobs steering the mutator's weighted choices. One byte per knob.
///
/// The mutator holds the knobs read-only; campaigns that want a different
/// mutation mix construct their own `Knobs` up front.
#[derive(Debug, Clone)]
pub struct Knobs {
    values: [u8; NUM_KNOBS],
}

macro_rules! knob_ids {
    ($($(#[$meta:meta])* $name:ident = $idx:expr;)*) => {
        impl Knobs {
            $($(#[$meta])* pub const $name: KnobId = KnobId($idx);)*
        }
    };
}

knob_ids! {
    // Same-size mutation primitives.
    FLIP_BIT = 0;
    SWAP_BYTES = 1;
    CHANGE_BYTE = 2;
    OVERWRITE_FROM_DICTIONARY = 3;
    OVERWRITE_FROM_CMP_DICTIONARY = 4;
    // Size-changing primitives.
    INSERT_BYTES = 5;
    INSERT_FROM_DICTIONARY = 6;
    ERASE_BYTES = 7;
    // The three size families, as chosen by `mutate`.
    MUTATE_SAME_SIZE = 8;
    MUTATE_DECREASE_SIZE = 9;
    MUTATE_INCREASE_SIZE = 10;
    // Crossover: insert a slice of the other input vs overwrite with it.
    CROSSOVER_INSERT = 11;
    CROSSOVER_OVERWRITE = 12;
}

impl Knobs {
    /// All knobs weighted equally.
    pub fn uniform() -> Self {
        Self {
            values: [1; NUM_KNOBS],
        }
    }

    /// Sets the weight of one knob. Zero removes the choice from weighted
    /// selection (unless every sibling is also zero).
    pub fn set(&mut self, id: KnobId, value: u8) -> &mut Self {
        self.values[id.0] = value;
        self
    }

    pub fn value(&self, id: KnobId) -> u64 {
        u64::from(self.values[id.0])
    }

    /// Picks one of `choices` with probability proportional to the
    /// corresponding knob values, consuming one random draw. Falls back
    /// to a uniform pick when all listed knobs are zero.
    ///
    /// # Panics
    /// Panics if `ids` and `choices` differ in length or are empty.
    pub fn choose<'a, T>(&self, ids: &[KnobId], choices: &'a [T], random: u64) -> &'a T {
        assert_eq!(ids.len(), choices.len());
        assert!(!choices.is_empty());
        let total: u64 = ids.iter().map(|&id| self.value(id)).sum();
        if total == 0 {
            return &choices[(random % choices.len() as u64) as usize];
        }
        let mut remaining = random % total;
        for (idx, &id) in ids.iter().enumerate() {
            let weight = self.value(id);
            if remaining < weight {
                return &choices[idx];
            }
            remaining -= weight;
        }
        unreachable!("weighted selection must land inside the total");
    }

    /// Weighted boolean: true with probability `value(a) / (value(a) +
    /// value(b))`, 50/50 when both are zero.
    pub fn choose_bool(&self, a: KnobId, b: KnobId, random: u64) -> bool {
        *self.choose(&[a, b], &[true, false], random)
    }
}

impl Default for Knobs {
    fn default() -> Self {
        Self::uniform()
    }
}
