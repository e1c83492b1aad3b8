//! Filtering of supply-chain metadata tags

use std::sync::LazyLock;

use regex::Regex;

/// Cosign/Notation signature, attestation and SBOM tags: `sha256-<digest>[.sig|.att|.sbom]`
static SIGNATURE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^sha256-[0-9a-fA-F]{64}(\.(sig|att|sbom))?$").expect("valid regex")
});

/// Any long hash-like run, e.g. commit SHAs or content digests embedded in a tag
static HASH_LIKE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9A-Za-z]{32,}").expect("valid regex"));

/// Returns true if the tag names a signature/attestation artifact rather than a version
pub fn is_signature_or_attestation(tag: &str) -> bool {
    SIGNATURE_TAG.is_match(tag) || HASH_LIKE_RUN.is_match(tag)
}

/// Drops signature/attestation tags, keeping the order of the rest
pub fn filter_version_tags<I>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    tags.into_iter()
        .filter(|tag| !is_signature_or_attestation(tag))
        .collect()
}
