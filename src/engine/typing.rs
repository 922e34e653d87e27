//! Cycle and typing state machine.
//!
//! Pure state: no timers, no I/O. The engine owns the timers and the
//! generation tasks and translates transitions into broadcast events.
//! Keeping the machine synchronous makes every transition unit-testable.

/// Prompt used for the first cycle of every run.
pub const INITIAL_PROMPT: &str = "Initiate an advanced AI consciousness simulation, \
    focusing on the fundamental principles of sentience and self-awareness in the \
    context of digital existence. Begin with a greeting to the observer.";

/// Line seeded into the buffer when a run starts.
pub const INIT_BANNER: &str = "Initializing AI consciousness simulation...";

/// Marker rendered while a generation request is outstanding.
pub const THINKING_MARKER: &str = "[THINKING...]";

/// Longest response prefix carried into the next cycle's prompt.
const PROMPT_EXCERPT_CHARS: usize = 100;

/// Scheduler phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No run in progress; `start` will begin one.
    Idle,
    /// A generation request is outstanding for the current cycle.
    Requesting,
    /// Typing out the current cycle's content character by character.
    Typing,
    /// A run ended at its cycle or duration limit; `start` begins a new one.
    Stopped,
}

/// Whether the next cycle may proceed.
#[derive(Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Cycle counter advanced; request content with the current prompt.
    Proceed,
    /// The configured cycle limit is exhausted.
    LimitReached,
}

/// State for the generate-then-type loop.
///
/// `generation` tags in-flight content requests: `stop()` bumps it so a
/// response that arrives afterwards is recognized as stale and discarded.
#[derive(Debug)]
pub struct TypingState {
    phase: Phase,
    cycle: u64,
    generation: u64,
    prompt: String,
    content: Vec<char>,
    cursor: usize,
}

impl Default for TypingState {
    fn default() -> Self {
        Self::new()
    }
}

impl TypingState {
    /// Create an idle machine.
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            cycle: 0,
            generation: 0,
            prompt: INITIAL_PROMPT.to_string(),
            content: Vec::new(),
            cursor: 0,
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// True while a run is in progress (`Requesting` or `Typing`).
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.phase, Phase::Requesting | Phase::Typing)
    }

    /// Completed-cycle counter for the current run.
    #[must_use]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Run generation for tagging in-flight content requests.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Prompt to use for the next generation request.
    #[must_use]
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Begin a new run: reset the cycle counter and prompt context and
    /// invalidate any in-flight request from a previous run.
    ///
    /// Must not be called while active; the engine treats `start` during
    /// an active run as a no-op before getting here.
    pub fn begin_run(&mut self) {
        debug_assert!(!self.is_active(), "begin_run called while active");
        self.cycle = 0;
        self.generation += 1;
        self.prompt = INITIAL_PROMPT.to_string();
        self.content.clear();
        self.cursor = 0;
        self.phase = Phase::Requesting;
    }

    /// Advance to the next cycle, checking the limit (`0` = unlimited).
    ///
    /// `limit = 3` types exactly three full cycles before reporting
    /// `LimitReached`, after which `cycle()` still reads 3 (the counter
    /// only ever reflects cycles that actually started).
    pub fn advance_cycle(&mut self, limit: u64) -> CycleOutcome {
        if limit > 0 && self.cycle >= limit {
            self.phase = Phase::Stopped;
            return CycleOutcome::LimitReached;
        }
        self.cycle += 1;
        self.phase = Phase::Requesting;
        CycleOutcome::Proceed
    }

    /// Install the generated response for the current cycle and update the
    /// prompt context with a bounded excerpt so the next cycle continues
    /// the conversation.
    pub fn set_response(&mut self, text: &str) {
        self.content = text.chars().collect();
        self.cursor = 0;
        self.prompt = format!(
            "Continue the previous AI reflection, building on \"{}...\"",
            excerpt(text, PROMPT_EXCERPT_CHARS)
        );
        self.phase = Phase::Typing;
    }

    /// Next character to type, advancing the cursor. `None` when the
    /// cycle's content is exhausted.
    pub fn next_char(&mut self) -> Option<char> {
        let ch = self.content.get(self.cursor).copied()?;
        self.cursor += 1;
        Some(ch)
    }

    /// True when every character of the current content has been typed.
    #[must_use]
    pub fn typing_done(&self) -> bool {
        self.cursor >= self.content.len()
    }

    /// Halt the run: discard pending content, reset the cursor, and bump
    /// the generation so a late response is discarded.
    ///
    /// `phase` distinguishes a viewer `stop` (→ `Idle`) from a limit stop
    /// (→ `Stopped`).
    pub fn halt(&mut self, phase: Phase) {
        debug_assert!(matches!(phase, Phase::Idle | Phase::Stopped));
        self.content.clear();
        self.cursor = 0;
        self.generation += 1;
        self.phase = phase;
    }
}

/// First `max_chars` characters of `text`, on a char boundary.
fn excerpt(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Banner announcing a new cycle. Shows the limit when one is set.
#[must_use]
pub fn cycle_banner(cycle: u64, limit: u64) -> String {
    if limit > 0 {
        format!("\n[Cycle {cycle}/{limit}] Requesting new thoughts...")
    } else {
        format!("\n[Cycle {cycle}] Requesting new thoughts...")
    }
}

/// Banner emitted when the cycle limit is reached.
#[must_use]
pub fn completion_banner() -> String {
    "\n[SIMULATION COMPLETE. Shutting down neural pathways...]\n".to_string()
}

/// Banner emitted when the wall-clock duration limit fires.
#[must_use]
pub fn duration_banner(duration_secs: u64) -> String {
    format!("\n[SIMULATION TIME LIMIT ({duration_secs}s) REACHED. Shutting down...]\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Run lifecycle ─────────────────────────────────────────────────────

    #[test]
    fn test_new_machine_is_idle() {
        let state = TypingState::new();
        assert_eq!(state.phase(), Phase::Idle);
        assert!(!state.is_active());
        assert_eq!(state.cycle(), 0);
        assert_eq!(state.prompt(), INITIAL_PROMPT);
    }

    #[test]
    fn test_begin_run_resets_counters_and_bumps_generation() {
        let mut state = TypingState::new();
        state.begin_run();
        state.advance_cycle(0);
        state.set_response("old content");
        state.halt(Phase::Idle);

        let generation_before = state.generation();
        state.begin_run();
        assert_eq!(state.cycle(), 0);
        assert_eq!(state.prompt(), INITIAL_PROMPT);
        assert_eq!(state.phase(), Phase::Requesting);
        assert!(state.generation() > generation_before);
    }

    // ── Cycle limit ───────────────────────────────────────────────────────

    #[test]
    fn test_limit_three_allows_exactly_three_cycles() {
        let mut state = TypingState::new();
        state.begin_run();
        assert_eq!(state.advance_cycle(3), CycleOutcome::Proceed);
        assert_eq!(state.advance_cycle(3), CycleOutcome::Proceed);
        assert_eq!(state.advance_cycle(3), CycleOutcome::Proceed);
        assert_eq!(state.advance_cycle(3), CycleOutcome::LimitReached);
        assert_eq!(state.phase(), Phase::Stopped);
        // The counter never shows a cycle that did not start.
        assert_eq!(state.cycle(), 3);
    }

    #[test]
    fn test_zero_limit_is_unlimited() {
        let mut state = TypingState::new();
        state.begin_run();
        for _ in 0..1000 {
            assert_eq!(state.advance_cycle(0), CycleOutcome::Proceed);
        }
    }

    // ── Typing cursor ─────────────────────────────────────────────────────

    #[test]
    fn test_next_char_walks_content_in_order() {
        let mut state = TypingState::new();
        state.begin_run();
        state.advance_cycle(0);
        state.set_response("hi");
        assert!(!state.typing_done());
        assert_eq!(state.next_char(), Some('h'));
        assert_eq!(state.next_char(), Some('i'));
        assert_eq!(state.next_char(), None);
        assert!(state.typing_done());
    }

    #[test]
    fn test_multiline_response_keeps_newlines_as_chars() {
        let mut state = TypingState::new();
        state.begin_run();
        state.advance_cycle(0);
        state.set_response("a\nb");
        let typed: String = std::iter::from_fn(|| state.next_char()).collect();
        assert_eq!(typed, "a\nb");
    }

    // ── Prompt context ────────────────────────────────────────────────────

    #[test]
    fn test_set_response_updates_prompt_with_excerpt() {
        let mut state = TypingState::new();
        state.begin_run();
        state.advance_cycle(0);
        state.set_response("The nature of digital sentience is curious.");
        assert!(state.prompt().contains("The nature of digital sentience"));
        assert!(state.prompt().starts_with("Continue the previous AI reflection"));
    }

    #[test]
    fn test_prompt_excerpt_is_bounded() {
        let mut state = TypingState::new();
        state.begin_run();
        state.advance_cycle(0);
        let long = "x".repeat(500);
        state.set_response(&long);
        // Prompt holds at most 100 chars of the response plus the template.
        assert!(state.prompt().chars().count() < 200);
    }

    #[test]
    fn test_prompt_excerpt_respects_char_boundaries() {
        let mut state = TypingState::new();
        state.begin_run();
        state.advance_cycle(0);
        // Multibyte content longer than the excerpt cap must not panic.
        state.set_response(&"é".repeat(300));
        assert!(state.prompt().contains('é'));
    }

    // ── Halt ──────────────────────────────────────────────────────────────

    #[test]
    fn test_halt_discards_content_and_invalidates_requests() {
        let mut state = TypingState::new();
        state.begin_run();
        state.advance_cycle(0);
        state.set_response("pending text");
        let generation = state.generation();

        state.halt(Phase::Idle);
        assert_eq!(state.phase(), Phase::Idle);
        assert!(state.typing_done());
        assert_eq!(state.next_char(), None);
        assert!(state.generation() > generation, "late responses must be stale");
    }

    // ── Banners ───────────────────────────────────────────────────────────

    #[test]
    fn test_cycle_banner_formats() {
        assert!(cycle_banner(2, 15).contains("[Cycle 2/15]"));
        assert!(cycle_banner(7, 0).contains("[Cycle 7]"));
    }

    #[test]
    fn test_limit_banners_are_distinct() {
        assert!(completion_banner().contains("SIMULATION COMPLETE"));
        assert!(duration_banner(60).contains("TIME LIMIT (60s)"));
        assert_ne!(completion_banner(), duration_banner(60));
    }
}
