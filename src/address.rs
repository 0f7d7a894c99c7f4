use regex::Regex;
use std::sync::OnceLock;

fn address_shape() -> &'static Regex {
    static SHAPE: OnceLock<Regex> = OnceLock::new();
    SHAPE.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static pattern"))
}

/// Normalize an address into its ledger key (trimmed, lower-cased)
pub fn normalize(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Basic address-shape check: `local@domain.tld`, no whitespace, one `@`.
pub fn is_valid_email(address: &str) -> bool {
    address_shape().is_match(address.trim())
}
