use thiserror::Error;

const COLOR_WORDS: &[&str] = &[
    "red", "blue", "green", "black", "white", "gray", "grey", "gold", "silver", "maroon",
    "yellow", "pink", "purple", "brown", "orange",
];

/// Keyword groups → category tag. A tag applies if any keyword appears as a substring.
const CATEGORY_KEYWORDS: &[(&[&str], &str)] = &[
    (&["airpods", "earbud", "headphone", "laptop", "phone", "charger", "tech"], "technology"),
    (&["hoodie", "jacket", "coat", "shirt", "glove", "hat", "cap", "scarf", "shoe"], "clothing"),
    (&["card", "student card", "id"], "id"),
    (&["key", "keys", "fob"], "keys"),
    (&["bottle", "water"], "water bottle"),
    (&["book", "textbook", "notebook"], "book"),
    (&["bag", "backpack", "purse", "tote"], "bag"),
    (&["ball", "cleat", "sport", "gym"], "sports"),
];

const MAX_SUGGESTED_TAGS: usize = 8;

/// Suggest search tags for a found item from what the poster typed.
///
/// Order is stable: colors, categories, location tags, then the fixed
/// `found`/`campus` pair. Capped at eight.
pub fn suggest_tags(description: &str, filename: Option<&str>, location: Option<&str>) -> Vec<String> {
    let text = format!(
        "{} {} {}",
        description,
        filename.unwrap_or(""),
        location.unwrap_or("")
    )
    .to_lowercase();

    let mut tags: Vec<String> = Vec::new();
    let mut push = |tag: &str| {
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    };

    for color in COLOR_WORDS {
        if text.contains(color) {
            push(color);
        }
    }

    for (keywords, tag) in CATEGORY_KEYWORDS {
        if keywords.iter().any(|k| text.contains(k)) {
            push(tag);
        }
    }

    let location = location.unwrap_or("").to_lowercase();
    if location.contains("musc") {
        push("musc");
    }
    if location.contains("mills") {
        push("mills");
    }
    push("found");
    push("campus");

    tags.truncate(MAX_SUGGESTED_TAGS);
    tags
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmailError {
    #[error("email is empty")]
    Empty,
    #[error("an @{0} email address is required")]
    WrongDomain(String),
}

/// Trim, lowercase and check the institutional domain. Runs before any store call.
pub fn validate_campus_email(email: &str, domain: &str) -> Result<String, EmailError> {
    let cleaned = email.trim().to_lowercase();
    if cleaned.is_empty() {
        return Err(EmailError::Empty);
    }

    let suffix = format!("@{}", domain.trim_start_matches('@').to_lowercase());
    match cleaned.strip_suffix(&suffix) {
        Some(local) if !local.is_empty() && !local.contains('@') => Ok(cleaned),
        _ => Err(EmailError::WrongDomain(domain.trim_start_matches('@').to_string())),
    }
}

/// Local part of an email, used as the short sender handle in chats.
pub fn handle_from_email(email: &str) -> &str {
    email.split('@').next().unwrap_or(email)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggests_colors_categories_and_location() {
        let tags = suggest_tags("Black North Face backpack", Some("IMG_0042.jpg"), Some("MUSC food court"));
        assert_eq!(tags, vec!["black", "bag", "musc", "found", "campus"]);
    }

    #[test]
    fn suggestions_are_capped() {
        let tags = suggest_tags(
            "red blue green black white gray laptop hoodie keys",
            None,
            Some("Mills"),
        );
        assert_eq!(tags.len(), 8);
        assert_eq!(tags[0], "red");
    }

    #[test]
    fn campus_email_domain_is_enforced() {
        assert_eq!(
            validate_campus_email("  Smithj@McMaster.ca ", "mcmaster.ca"),
            Ok("smithj@mcmaster.ca".to_string())
        );
        assert_eq!(
            validate_campus_email("smithj@gmail.com", "mcmaster.ca"),
            Err(EmailError::WrongDomain("mcmaster.ca".into()))
        );
        assert_eq!(
            validate_campus_email("@mcmaster.ca", "mcmaster.ca"),
            Err(EmailError::WrongDomain("mcmaster.ca".into()))
        );
        assert_eq!(validate_campus_email("   ", "mcmaster.ca"), Err(EmailError::Empty));
    }

    #[test]
    fn handle_is_local_part() {
        assert_eq!(handle_from_email("smithj@mcmaster.ca"), "smithj");
        assert_eq!(handle_from_email("nobody"), "nobody");
    }
}
