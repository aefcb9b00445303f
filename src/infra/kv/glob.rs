/// Match `text` against a Redis-style glob: `*`, `?`, `[abc]`, `[a-z]`, `[^x]`,
/// and `\` to escape the next character.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    // Position of the last `*` and the text index it is currently absorbing up to.
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < text.len() {
        let step = if pi < pattern.len() {
            match pattern[pi] {
                '*' => {
                    backtrack = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '?' => Some(pi + 1),
                '[' => match match_class(&pattern, pi, text[ti]) {
                    Some((true, next)) => Some(next),
                    Some((false, _)) => None,
                    None => (text[ti] == '[').then_some(pi + 1),
                },
                '\\' if pi + 1 < pattern.len() => (pattern[pi + 1] == text[ti]).then_some(pi + 2),
                literal => (literal == text[ti]).then_some(pi + 1),
            }
        } else {
            None
        };

        match (step, backtrack) {
            (Some(next), _) => {
                pi = next;
                ti += 1;
            }
            (None, Some((star, absorbed))) => {
                pi = star + 1;
                ti = absorbed + 1;
                backtrack = Some((star, absorbed + 1));
            }
            (None, None) => return false,
        }
    }

    pattern[pi..].iter().all(|c| *c == '*')
}

/// Evaluate a `[...]` class starting at `start`. Returns whether `c` matched and
/// the index after the closing bracket, or `None` when the class is unterminated.
fn match_class(pattern: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = pattern.get(i) == Some(&'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    let mut first = true;
    while i < pattern.len() {
        let current = pattern[i];
        if current == ']' && !first {
            return Some((matched != negate, i + 1));
        }
        first = false;

        if current == '\\' && i + 1 < pattern.len() {
            matched |= pattern[i + 1] == c;
            i += 2;
            continue;
        }

        if i + 2 < pattern.len() && pattern[i + 1] == '-' && pattern[i + 2] != ']' {
            let (lo, hi) = if current <= pattern[i + 2] {
                (current, pattern[i + 2])
            } else {
                (pattern[i + 2], current)
            };
            matched |= lo <= c && c <= hi;
            i += 3;
            continue;
        }

        matched |= current == c;
        i += 1;
    }

    None
}
