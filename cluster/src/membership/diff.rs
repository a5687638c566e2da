/// Difference of two ascending sequences in one linear pass.
///
/// Returns `(only_in_first, only_in_second)`, both ascending. Both inputs must
/// already be sorted ascending; unsorted input gives a meaningless (but
/// panic-free) result.
pub fn sorted_diff<T: Ord + Clone>(first: &[T], second: &[T]) -> (Vec<T>, Vec<T>) {
    let mut only_first = Vec::new();
    let mut only_second = Vec::new();
    let (mut a, mut b) = (0, 0);

    while a < first.len() && b < second.len() {
        match first[a].cmp(&second[b]) {
            std::cmp::Ordering::Less => {
                only_first.push(first[a].clone());
                a += 1;
            }
            std::cmp::Ordering::Greater => {
                only_second.push(second[b].clone());
                b += 1;
            }
            std::cmp::Ordering::Equal => {
                a += 1;
                b += 1;
            }
        }
    }

    only_first.extend_from_slice(&first[a..]);
    only_second.extend_from_slice(&second[b..]);
    (only_first, only_second)
}
