use rand::Rng;

/// Draws an election timeout, in ticks, uniformly from `min..=max`.
pub fn random_election_timeout(min_ticks: i64, max_ticks: i64) -> i64 {
    let mut rng = rand::thread_rng();
    rng.gen_range(min_ticks..=max_ticks.max(min_ticks))
}
