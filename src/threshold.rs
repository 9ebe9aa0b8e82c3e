/// Minimum number of cooperating parties required to reconstruct a secret
/// shared across a pool of `n` parties.
///
/// Integer division truncates, so `threshold(1) == 1` and `threshold(3) == 2`.
pub fn threshold(n: usize) -> usize {
    (n + 1) * 2 / 3
}
