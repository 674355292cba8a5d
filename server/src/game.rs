use crate::config::Scoring;
use crate::dictionary::WordEntry;
use log::{debug, info};
use std::cmp::Ordering;
use std::time::{Duration, Instant};

/// What the match loop should tell a player after they act.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Ask this word next.
    Ask(String),
    /// The player has answered every word and waits for the result.
    Completed,
    /// The packet does not change the match.
    Ignored,
}

#[derive(Debug, Clone)]
struct PlayerState {
    nickname: String,
    next_word: usize,
    score: i32,
    started_at: Option<Instant>,
    completion: Option<Duration>,
}

impl PlayerState {
    fn new(nickname: String) -> Self {
        Self {
            nickname,
            next_word: 0,
            score: 0,
            started_at: None,
            completion: None,
        }
    }

    fn is_playing(&self) -> bool {
        self.started_at.is_some() && self.completion.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalScore {
    pub nickname: String,
    pub score: i32,
}

/// Result of a finished match, winner first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchOutcome {
    pub winner: String,
    pub standings: Vec<FinalScore>,
}

impl MatchOutcome {
    pub fn score_of(&self, nickname: &str) -> Option<i32> {
        self.standings
            .iter()
            .find(|entry| entry.nickname == nickname)
            .map(|entry| entry.score)
    }
}

/// Scoring state of one 1v1 match. Both players get the same words in the
/// same order, each at their own pace.
#[derive(Debug, Clone)]
pub struct Match {
    players: [PlayerState; 2],
    words: Vec<WordEntry>,
    scoring: Scoring,
}

impl Match {
    pub fn new(players: [String; 2], words: Vec<WordEntry>, scoring: Scoring) -> Self {
        let [first, second] = players;
        Self {
            players: [PlayerState::new(first), PlayerState::new(second)],
            words,
            scoring,
        }
    }

    pub fn score(&self, nickname: &str) -> Option<i32> {
        self.player(nickname).map(|p| self.players[p].score)
    }

    /// The player acknowledged setup: start their clock and hand out the
    /// first word. Repeated acknowledgements are ignored.
    pub fn start(&mut self, nickname: &str, now: Instant) -> Progress {
        let Some(p) = self.player(nickname) else {
            return Progress::Ignored;
        };
        if self.players[p].started_at.is_some() {
            return Progress::Ignored;
        }
        self.players[p].started_at = Some(now);
        debug!("{} started the match", nickname);
        self.advance(p, now)
    }

    /// Scores a translation of the last word asked to `nickname`.
    pub fn answer(&mut self, nickname: &str, translation: &str, now: Instant) -> Progress {
        let Some(p) = self.player(nickname) else {
            return Progress::Ignored;
        };
        if !self.players[p].is_playing() || self.players[p].next_word == 0 {
            return Progress::Ignored;
        }

        let (word, translations) = &self.words[self.players[p].next_word - 1];
        let given = normalize(translation);
        let correct = translations.iter().any(|t| normalize(t) == given);
        if correct {
            self.players[p].score += self.scoring.word_bonus;
        } else {
            self.players[p].score -= self.scoring.word_malus;
        }
        debug!(
            "{} translated {:?} as {:?}: {}",
            nickname,
            word,
            translation,
            if correct { "correct" } else { "wrong" }
        );
        self.advance(p, now)
    }

    /// Whether both players have answered every word.
    pub fn is_finished(&self) -> bool {
        self.players.iter().all(|p| p.completion.is_some())
    }

    /// Ranks the players by score, then by who completed first, and
    /// awards the winner the extra points.
    pub fn outcome(&self) -> MatchOutcome {
        let mut order = [0usize, 1];
        order.sort_by(|&a, &b| self.compare(a, b));

        let standings: Vec<FinalScore> = order
            .iter()
            .enumerate()
            .map(|(rank, &p)| FinalScore {
                nickname: self.players[p].nickname.clone(),
                score: self.players[p].score
                    + if rank == 0 {
                        self.scoring.winner_extra_points
                    } else {
                        0
                    },
            })
            .collect();
        let winner = standings[0].nickname.clone();
        info!("Match won by {} ({:?})", winner, standings);
        MatchOutcome { winner, standings }
    }

    fn compare(&self, a: usize, b: usize) -> Ordering {
        let (pa, pb) = (&self.players[a], &self.players[b]);
        pb.score
            .cmp(&pa.score)
            .then_with(|| match (pa.completion, pb.completion) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| a.cmp(&b))
    }

    fn advance(&mut self, p: usize, now: Instant) -> Progress {
        let player = &mut self.players[p];
        match self.words.get(player.next_word) {
            Some((word, _)) => {
                player.next_word += 1;
                Progress::Ask(word.clone())
            }
            None => {
                let started = player.started_at.unwrap_or(now);
                player.completion = Some(now.saturating_duration_since(started));
                debug!("{} completed in {:?}", player.nickname, player.completion);
                Progress::Completed
            }
        }
    }

    fn player(&self, nickname: &str) -> Option<usize> {
        self.players.iter().position(|p| p.nickname == nickname)
    }
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}
