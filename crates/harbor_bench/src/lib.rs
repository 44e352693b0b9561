//! Benchmark utilities.

use harbor_model::Record;
use harbor_testkit::comment;
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Random alphanumeric text of `len` characters.
pub fn random_text(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// `count` comments with `content_len` characters of content each.
pub fn generate_comments(count: usize, content_len: usize) -> Vec<Record> {
    (0..count)
        .map(|i| comment(&format!("c{i}"), &random_text(content_len), None))
        .collect()
}
