//! Display name and avatar generation.

use rand::Rng;
use std::collections::HashSet;

const SYLLABLES: [&str; 14] = [
    "la", "no", "ra", "mi", "ka", "ta", "le", "ve", "xo", "zi", "an", "el", "or", "un",
];

/// Number of avatar images available
pub const AVATAR_COUNT: u32 = 30;

/// Attempts before falling back to a numeric suffix
const MAX_ATTEMPTS: usize = 64;

/// Generate a capitalized name of two or three syllables
pub fn generate_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    let count = rng.gen_range(2..=3);
    let raw: String = (0..count)
        .map(|_| SYLLABLES[rng.gen_range(0..SYLLABLES.len())])
        .collect();
    capitalize(&raw)
}

/// Generate a name not present in `taken`
pub fn generate_unique_name<R: Rng + ?Sized>(rng: &mut R, taken: &HashSet<String>) -> String {
    for _ in 0..MAX_ATTEMPTS {
        let name = generate_name(rng);
        if !taken.contains(&name) {
            return name;
        }
    }

    // Name space nearly exhausted; disambiguate with a counter
    let base = generate_name(rng);
    (2u32..)
        .map(|n| format!("{base}{n}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or(base)
}

/// Pick a random avatar reference
pub fn generate_avatar<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!(
        "/avatars/adventurer/adventurer-{}.webp",
        rng.gen_range(0..AVATAR_COUNT)
    )
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_name_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let name = generate_name(&mut rng);
            assert!((4..=6).contains(&name.len()), "bad length: {name}");
            assert!(name.chars().next().unwrap().is_uppercase());
            assert!(name.chars().skip(1).all(|c| c.is_ascii_lowercase()));
        }
    }

    #[test]
    fn test_unique_name_avoids_taken() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut taken = HashSet::new();
        for _ in 0..500 {
            let name = generate_unique_name(&mut rng, &taken);
            assert!(taken.insert(name));
        }
    }

    #[test]
    fn test_avatar_range() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let avatar = generate_avatar(&mut rng);
            let idx: u32 = avatar
                .trim_start_matches("/avatars/adventurer/adventurer-")
                .trim_end_matches(".webp")
                .parse()
                .unwrap();
            assert!(idx < AVATAR_COUNT);
        }
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("lano"), "Lano");
        assert_eq!(capitalize(""), "");
    }
}
