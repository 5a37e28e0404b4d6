use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::StudyError;
use crate::label::{StudyGroup, TrialItem};

/// Draw the trial set for one session: filter the catalog to `group`, then
/// take `min(k, |filtered|)` items without replacement via a partial
/// Fisher-Yates shuffle under `ChaCha8Rng::seed_from_u64(seed)`. The draw is
/// bit-reproducible for a fixed `(group, seed, k, items)`, which is what
/// makes session resume a pure re-derivation.
///
/// The resulting order is the trial order.
pub fn sample_trials(
    items: &[TrialItem],
    group: StudyGroup,
    seed: u64,
    k: usize,
) -> Result<Vec<TrialItem>, StudyError> {
    let mut pool: Vec<TrialItem> = items.iter().filter(|it| it.group == group).cloned().collect();
    if pool.is_empty() {
        return Err(StudyError::NoItemsForGroup {
            group: group.as_str().to_string(),
        });
    }
    let draw = k.min(pool.len());
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    pool.partial_shuffle(&mut rng, draw);
    pool.truncate(draw);
    Ok(pool)
}
