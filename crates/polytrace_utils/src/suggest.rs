/// Closest candidate to `target` by edit distance, if one is near enough to be a typo.
pub fn find_best_match<S: AsRef<str>>(
    target: &str,
    candidates: impl IntoIterator<Item = S>,
) -> Option<String> {
    let threshold = if target.chars().count() < 3 { 1 } else { 2 };
    let mut best: Option<(usize, String)> = None;

    for candidate in candidates {
        let candidate = candidate.as_ref();
        if candidate == target {
            continue;
        }
        let distance = levenshtein_distance(target, candidate);
        if distance <= threshold && best.as_ref().is_none_or(|(d, _)| distance < *d) {
            best = Some((distance, candidate.to_string()));
        }
    }

    best.map(|(_, name)| name)
}

fn levenshtein_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut row = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            row[j + 1] = (prev[j + 1] + 1).min(row[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut row);
    }

    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggests_near_parameter_names() {
        let params = ["x", "y", "octopus"];
        assert_eq!(find_best_match("octopu", params), Some("octopus".to_string()));
        assert_eq!(find_best_match("kangaroo", params), None);
    }

    #[test]
    fn distance_basics() {
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("", "abc"), 3);
        assert_eq!(levenshtein_distance("same", "same"), 0);
    }
}
