use armada_protocol::LeaderboardEntry;

/// Number of entries shown on the leaderboard.
pub const LEADERBOARD_LEN: usize = 10;

/// Ranks `entries` by kills, most first, and keeps the top [`LEADERBOARD_LEN`].
///
/// The sort is stable, so players with equal kills keep the order they were
/// given in.
pub fn rank(entries: impl IntoIterator<Item = LeaderboardEntry>) -> Vec<LeaderboardEntry> {
	let mut entries: Vec<_> = entries.into_iter().collect();
	entries.sort_by(|a, b| b.kills.cmp(&a.kills));
	entries.truncate(LEADERBOARD_LEN);
	entries
}
