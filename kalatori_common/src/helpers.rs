/// Parse a boolean flag from a string value, or return the given default value otherwise.
pub fn parse_boolean_flag(value: Option<String>, default: bool) -> bool {
    let value = match value {
        Some(v) => v,
        None => return default,
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

const ADJECTIVES: [&str; 12] =
    ["amber", "brisk", "calm", "dusty", "eager", "fuzzy", "gentle", "hollow", "icy", "jolly", "keen", "lucky"];
const NOUNS: [&str; 12] =
    ["otter", "falcon", "badger", "heron", "lynx", "marmot", "newt", "osprey", "panda", "quail", "raven", "stoat"];

/// Builds a human-friendly name for a running instance from a random seed, e.g. `brisk-heron-4821`.
pub fn random_instance_name(seed: u64) -> String {
    let adjective = ADJECTIVES[(seed % ADJECTIVES.len() as u64) as usize];
    let noun = NOUNS[((seed >> 8) % NOUNS.len() as u64) as usize];
    let suffix = (seed >> 16) % 10_000;
    format!("{adjective}-{noun}-{suffix:04}")
}
