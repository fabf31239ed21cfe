//! Resource naming
//!
//! Names for networks, containers and build tags. Every name carries a
//! random component so concurrent jobs never collide.

use uuid::Uuid;

/// Label attached to every resource of a runner: the hex encoding of its name
pub fn runner_label(runner_name: &str) -> String {
    hex::encode(runner_name)
}

/// `--filter` argument selecting a runner's resources
pub fn label_filter(label: &str) -> String {
    format!("label={}", label)
}

/// Reduces an image reference to `[A-Za-z][A-Za-z0-9_]*`
///
/// Leading characters are dropped until the first letter.
pub fn sanitize(value: &str) -> String {
    let mut name = String::with_capacity(value.len());
    for c in value.chars() {
        let keep = if name.is_empty() {
            c.is_ascii_alphabetic()
        } else {
            c.is_ascii_alphanumeric() || c == '_'
        };
        if keep {
            name.push(c);
        }
    }
    name
}

/// Unique container name derived from its image
pub fn container_name(image: &str) -> String {
    format!(
        "{}_{}_{}",
        Uuid::new_v4().simple(),
        sanitize(image),
        short_id()
    )
}

/// Name of a per-job network
pub fn network_name() -> String {
    format!("github_network_{}", Uuid::new_v4())
}

/// Tag for an image built for a container step
pub fn build_tag(label: &str) -> String {
    format!("{}:{}", label, short_id())
}

fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(6);
    id
}
