//! The Slush → Snowflake → Snowball ladder.
//!
//! Each layer adds one piece of state. Slush keeps only the last choice a
//! successful poll favored. Snowflake adds a consecutive-success counter and
//! finalizes once it reaches β. Snowball additionally tallies every success
//! per choice and lets that history steer the preference, which makes the
//! instance far harder to flip with a short burst of adversarial votes.
//!
//! Instances come in three arities: unary (a lone choice gaining
//! confidence), binary (a choice and its single rival), and n-ary (an open
//! set of choices). The binary and unary forms are the workhorses inside
//! conflict sets and the vertex DAG; the n-ary form backs conflict sets
//! with many spenders.

use std::collections::HashMap;

use firn_ids::Id;

/// Slush over an open choice set: remembers the last winning choice.
#[derive(Debug, Clone)]
pub struct NnarySlush {
    preference: Id,
}

impl NnarySlush {
    #[must_use]
    pub fn new(initial: Id) -> Self {
        Self {
            preference: initial,
        }
    }

    #[must_use]
    pub fn preference(&self) -> Id {
        self.preference
    }

    pub fn record_successful_poll(&mut self, choice: Id) {
        self.preference = choice;
    }
}

/// Snowflake over an open choice set: slush plus a β-gated confidence run.
#[derive(Debug, Clone)]
pub struct NnarySnowflake {
    slush: NnarySlush,
    beta_virtuous: usize,
    beta_rogue: usize,
    confidence: usize,
    rogue: bool,
    finalized: bool,
}

impl NnarySnowflake {
    #[must_use]
    pub fn new(beta_virtuous: usize, beta_rogue: usize, initial: Id) -> Self {
        Self {
            slush: NnarySlush::new(initial),
            beta_virtuous,
            beta_rogue,
            confidence: 0,
            rogue: false,
            finalized: false,
        }
    }

    /// Registers that a rival choice exists; the rogue β applies from here on.
    pub fn add(&mut self, choice: Id) {
        if choice != self.slush.preference() {
            self.rogue = true;
        }
    }

    #[must_use]
    pub fn preference(&self) -> Id {
        self.slush.preference()
    }

    #[must_use]
    pub fn confidence(&self) -> usize {
        self.confidence
    }

    #[must_use]
    pub fn rogue(&self) -> bool {
        self.rogue
    }

    #[must_use]
    pub fn finalized(&self) -> bool {
        self.finalized
    }

    pub fn record_successful_poll(&mut self, choice: Id) {
        if self.finalized {
            return;
        }
        if choice == self.slush.preference() {
            self.confidence += 1;
        } else {
            self.confidence = 1;
            self.slush.record_successful_poll(choice);
        }
        self.finalized = (!self.rogue && self.confidence >= self.beta_virtuous)
            || self.confidence >= self.beta_rogue;
    }

    pub fn record_unsuccessful_poll(&mut self) {
        if !self.finalized {
            self.confidence = 0;
        }
    }
}

/// Snowball over an open choice set: snowflake plus per-choice success
/// tallies that steer the preference.
///
/// The reported preference switches only when a choice's tally strictly
/// exceeds the current preference's; on an equal tally the previously set
/// preference stands. This keeps replays deterministic for a fixed vote
/// order.
#[derive(Debug, Clone)]
pub struct NnarySnowball {
    snowflake: NnarySnowflake,
    successes: HashMap<Id, usize>,
    preference: Id,
}

impl NnarySnowball {
    #[must_use]
    pub fn new(beta_virtuous: usize, beta_rogue: usize, initial: Id) -> Self {
        let mut successes = HashMap::new();
        successes.insert(initial, 0);
        Self {
            snowflake: NnarySnowflake::new(beta_virtuous, beta_rogue, initial),
            successes,
            preference: initial,
        }
    }

    pub fn add(&mut self, choice: Id) {
        self.successes.entry(choice).or_insert(0);
        self.snowflake.add(choice);
    }

    /// The historical favorite, or the snowflake's choice once finalized.
    #[must_use]
    pub fn preference(&self) -> Id {
        if self.snowflake.finalized() {
            self.snowflake.preference()
        } else {
            self.preference
        }
    }

    #[must_use]
    pub fn num_successful_polls(&self, choice: &Id) -> usize {
        self.successes.get(choice).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn confidence(&self) -> usize {
        self.snowflake.confidence()
    }

    #[must_use]
    pub fn finalized(&self) -> bool {
        self.snowflake.finalized()
    }

    pub fn record_successful_poll(&mut self, choice: Id) {
        if self.finalized() {
            return;
        }
        let tally = self.successes.entry(choice).or_insert(0);
        *tally += 1;
        let tally = *tally;
        if tally > self.num_successful_polls(&self.preference) && choice != self.preference {
            self.preference = choice;
        }
        self.snowflake.record_successful_poll(choice);
    }

    pub fn record_unsuccessful_poll(&mut self) {
        self.snowflake.record_unsuccessful_poll();
    }
}

/// Binary slush: the preference is one of two rivals, indexed 0 or 1.
#[derive(Debug, Clone)]
pub struct BinarySlush {
    preference: u8,
}

impl BinarySlush {
    #[must_use]
    pub fn new(initial: u8) -> Self {
        debug_assert!(initial < 2);
        Self {
            preference: initial,
        }
    }

    #[must_use]
    pub fn preference(&self) -> u8 {
        self.preference
    }

    pub fn record_successful_poll(&mut self, choice: u8) {
        self.preference = choice;
    }
}

/// Binary snowflake with a single β (the caller picks virtuous or rogue).
#[derive(Debug, Clone)]
pub struct BinarySnowflake {
    slush: BinarySlush,
    beta: usize,
    confidence: usize,
    finalized: bool,
}

impl BinarySnowflake {
    #[must_use]
    pub fn new(beta: usize, initial: u8) -> Self {
        Self {
            slush: BinarySlush::new(initial),
            beta,
            confidence: 0,
            finalized: false,
        }
    }

    #[must_use]
    pub fn preference(&self) -> u8 {
        self.slush.preference()
    }

    #[must_use]
    pub fn finalized(&self) -> bool {
        self.finalized
    }

    pub fn record_successful_poll(&mut self, choice: u8) {
        if self.finalized {
            return;
        }
        if choice == self.slush.preference() {
            self.confidence += 1;
        } else {
            self.confidence = 1;
            self.slush.record_successful_poll(choice);
        }
        self.finalized = self.confidence >= self.beta;
    }

    pub fn record_unsuccessful_poll(&mut self) {
        if !self.finalized {
            self.confidence = 0;
        }
    }
}

/// Binary snowball: per-side tallies steering the preference.
#[derive(Debug, Clone)]
pub struct BinarySnowball {
    snowflake: BinarySnowflake,
    successes: [usize; 2],
    preference: u8,
}

impl BinarySnowball {
    #[must_use]
    pub fn new(beta: usize, initial: u8) -> Self {
        Self {
            snowflake: BinarySnowflake::new(beta, initial),
            successes: [0, 0],
            preference: initial,
        }
    }

    #[must_use]
    pub fn preference(&self) -> u8 {
        if self.snowflake.finalized() {
            self.snowflake.preference()
        } else {
            self.preference
        }
    }

    #[must_use]
    pub fn finalized(&self) -> bool {
        self.snowflake.finalized()
    }

    pub fn record_successful_poll(&mut self, choice: u8) {
        if self.finalized() {
            return;
        }
        let side = usize::from(choice & 1);
        self.successes[side] += 1;
        if self.successes[side] > self.successes[usize::from(self.preference & 1)] {
            self.preference = choice;
        }
        self.snowflake.record_successful_poll(choice);
    }

    pub fn record_unsuccessful_poll(&mut self) {
        self.snowflake.record_unsuccessful_poll();
    }
}

/// Unary snowflake: one choice gaining confidence, with the β requirement
/// switching to the rogue value when a conflict is later observed.
#[derive(Debug, Clone)]
pub struct UnarySnowflake {
    beta_virtuous: usize,
    beta_rogue: usize,
    confidence: usize,
    rogue: bool,
    finalized: bool,
}

impl UnarySnowflake {
    #[must_use]
    pub fn new(beta_virtuous: usize, beta_rogue: usize) -> Self {
        Self {
            beta_virtuous,
            beta_rogue,
            confidence: 0,
            rogue: false,
            finalized: false,
        }
    }

    /// Switches the finalization requirement to the rogue β.
    pub fn set_rogue(&mut self) {
        self.rogue = true;
    }

    #[must_use]
    pub fn rogue(&self) -> bool {
        self.rogue
    }

    #[must_use]
    pub fn confidence(&self) -> usize {
        self.confidence
    }

    #[must_use]
    pub fn finalized(&self) -> bool {
        self.finalized
    }

    pub fn record_successful_poll(&mut self) {
        if self.finalized {
            return;
        }
        self.confidence += 1;
        self.finalized = (!self.rogue && self.confidence >= self.beta_virtuous)
            || self.confidence >= self.beta_rogue;
    }

    pub fn record_unsuccessful_poll(&mut self) {
        if !self.finalized {
            self.confidence = 0;
        }
    }

    /// Splits into a binary instance when a rival appears, carrying the
    /// accumulated confidence onto side `choice`.
    #[must_use]
    pub fn extend(&self, beta: usize, choice: u8) -> BinarySnowflake {
        let mut binary = BinarySnowflake::new(beta, choice);
        binary.confidence = self.confidence;
        binary.finalized = self.finalized;
        binary
    }
}

/// Unary snowball: unary snowflake plus the total success tally.
#[derive(Debug, Clone)]
pub struct UnarySnowball {
    snowflake: UnarySnowflake,
    successes: usize,
}

impl UnarySnowball {
    #[must_use]
    pub fn new(beta_virtuous: usize, beta_rogue: usize) -> Self {
        Self {
            snowflake: UnarySnowflake::new(beta_virtuous, beta_rogue),
            successes: 0,
        }
    }

    pub fn set_rogue(&mut self) {
        self.snowflake.set_rogue();
    }

    #[must_use]
    pub fn rogue(&self) -> bool {
        self.snowflake.rogue()
    }

    #[must_use]
    pub fn num_successful_polls(&self) -> usize {
        self.successes
    }

    #[must_use]
    pub fn confidence(&self) -> usize {
        self.snowflake.confidence()
    }

    #[must_use]
    pub fn finalized(&self) -> bool {
        self.snowflake.finalized()
    }

    pub fn record_successful_poll(&mut self) {
        if self.finalized() {
            return;
        }
        self.successes += 1;
        self.snowflake.record_successful_poll();
    }

    pub fn record_unsuccessful_poll(&mut self) {
        self.snowflake.record_unsuccessful_poll();
    }

    /// Splits into a binary snowball, seeding side `choice` with the
    /// accumulated tally and confidence.
    #[must_use]
    pub fn extend(&self, beta: usize, choice: u8) -> BinarySnowball {
        let mut binary = BinarySnowball::new(beta, choice);
        binary.successes[usize::from(choice & 1)] = self.successes;
        binary.preference = choice;
        binary.snowflake = self.snowflake.extend(beta, choice);
        binary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> Id {
        Id::EMPTY.prefixed(n)
    }

    #[test]
    fn slush_tracks_last_winner() {
        let mut sl = NnarySlush::new(id(0));
        assert_eq!(sl.preference(), id(0));
        sl.record_successful_poll(id(1));
        assert_eq!(sl.preference(), id(1));
        sl.record_successful_poll(id(0));
        assert_eq!(sl.preference(), id(0));
    }

    #[test]
    fn snowflake_virtuous_finalizes_at_beta_virtuous() {
        let mut sf = NnarySnowflake::new(2, 4, id(0));
        sf.record_successful_poll(id(0));
        assert!(!sf.finalized());
        sf.record_successful_poll(id(0));
        assert!(sf.finalized());
        assert_eq!(sf.preference(), id(0));
    }

    #[test]
    fn snowflake_rogue_needs_beta_rogue() {
        let mut sf = NnarySnowflake::new(2, 4, id(0));
        sf.add(id(1));
        assert!(sf.rogue());
        for _ in 0..3 {
            sf.record_successful_poll(id(0));
        }
        assert!(!sf.finalized());
        sf.record_successful_poll(id(0));
        assert!(sf.finalized());
    }

    #[test]
    fn snowflake_switch_resets_confidence() {
        let mut sf = NnarySnowflake::new(3, 3, id(0));
        sf.record_successful_poll(id(0));
        sf.record_successful_poll(id(0));
        sf.record_successful_poll(id(1));
        assert_eq!(sf.preference(), id(1));
        assert_eq!(sf.confidence(), 1);
        assert!(!sf.finalized());
    }

    #[test]
    fn snowflake_unsuccessful_resets() {
        let mut sf = NnarySnowflake::new(2, 2, id(0));
        sf.record_successful_poll(id(0));
        sf.record_unsuccessful_poll();
        assert_eq!(sf.confidence(), 0);
        sf.record_successful_poll(id(0));
        assert!(!sf.finalized());
        sf.record_successful_poll(id(0));
        assert!(sf.finalized());
    }

    #[test]
    fn snowflake_finalized_is_frozen() {
        let mut sf = NnarySnowflake::new(1, 1, id(0));
        sf.record_successful_poll(id(0));
        assert!(sf.finalized());
        sf.record_successful_poll(id(1));
        assert_eq!(sf.preference(), id(0));
        sf.record_unsuccessful_poll();
        assert!(sf.finalized());
    }

    #[test]
    fn snowball_preference_follows_the_tally() {
        let mut sb = NnarySnowball::new(5, 5, id(0));
        sb.add(id(1));

        sb.record_successful_poll(id(0));
        sb.record_successful_poll(id(0));
        sb.record_successful_poll(id(1));
        // 2 for choice 0, 1 for choice 1: history still favors 0
        assert_eq!(sb.preference(), id(0));

        sb.record_successful_poll(id(1));
        // equal tallies: the set preference stands
        assert_eq!(sb.preference(), id(0));

        sb.record_successful_poll(id(1));
        assert_eq!(sb.preference(), id(1));
        assert_eq!(sb.num_successful_polls(&id(1)), 3);
    }

    #[test]
    fn snowball_finalizes_through_its_snowflake() {
        let mut sb = NnarySnowball::new(2, 3, id(0));
        sb.add(id(1));
        for _ in 0..3 {
            sb.record_successful_poll(id(1));
        }
        assert!(sb.finalized());
        assert_eq!(sb.preference(), id(1));
    }

    #[test]
    fn binary_snowball_flips_on_strictly_greater() {
        let mut sb = BinarySnowball::new(3, 0);
        sb.record_successful_poll(1);
        assert_eq!(sb.preference(), 1);
        sb.record_successful_poll(0);
        // tied 1-1: preference was last set to 1
        assert_eq!(sb.preference(), 1);
        sb.record_successful_poll(0);
        assert_eq!(sb.preference(), 0);
    }

    #[test]
    fn binary_snowflake_finalizes() {
        let mut sf = BinarySnowflake::new(2, 0);
        sf.record_successful_poll(0);
        sf.record_successful_poll(0);
        assert!(sf.finalized());
        assert_eq!(sf.preference(), 0);
    }

    #[test]
    fn unary_rogue_switch_raises_the_bar() {
        let mut sf = UnarySnowflake::new(1, 3);
        sf.set_rogue();
        sf.record_successful_poll();
        assert!(!sf.finalized());
        sf.record_successful_poll();
        sf.record_successful_poll();
        assert!(sf.finalized());
    }

    #[test]
    fn unary_extend_carries_confidence() {
        let mut sb = UnarySnowball::new(5, 5);
        sb.record_successful_poll();
        sb.record_successful_poll();

        let mut binary = sb.extend(3, 0);
        assert_eq!(binary.preference(), 0);
        binary.record_successful_poll(0);
        // 2 carried + 1 = beta 3
        assert!(binary.finalized());
    }

    #[test]
    fn unary_unsuccessful_resets_confidence_not_tally() {
        let mut sb = UnarySnowball::new(3, 3);
        sb.record_successful_poll();
        sb.record_successful_poll();
        sb.record_unsuccessful_poll();
        assert_eq!(sb.confidence(), 0);
        assert_eq!(sb.num_successful_polls(), 2);
    }
}
