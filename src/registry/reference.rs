//! Image reference parsing (`[endpoint/]image[:tag]`)

use std::fmt;
use std::str::FromStr;

use crate::registry::error::RegistryError;

/// Canonical endpoint name for Docker Hub
pub const DOCKER_HUB_ENDPOINT: &str = "index.docker.io";

const DEFAULT_TAG: &str = "latest";

/// A fully qualified (endpoint, image, tag) triple
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub endpoint: String,
    pub image: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(endpoint: &str, image: &str, tag: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            image: image.to_string(),
            tag: tag.to_string(),
        }
    }
}

/// Returns true if the endpoint refers to Docker Hub under any of its aliases
pub fn is_docker_hub(endpoint: &str) -> bool {
    matches!(
        endpoint,
        "index.docker.io" | "docker.io" | "registry-1.docker.io"
    )
}

/// Docker Hub keeps official images under the `library/` namespace
pub fn normalize_docker_hub_image(image: &str) -> String {
    if image.contains('/') {
        image.to_string()
    } else {
        format!("library/{}", image)
    }
}

impl FromStr for ImageRef {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RegistryError::InvalidReference("empty reference".to_string()));
        }
        if s.contains('@') {
            return Err(RegistryError::InvalidReference(format!(
                "digest references are not supported: {}",
                s
            )));
        }

        // The first component is a registry host if it looks like one
        let (endpoint, remainder) = match s.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest)
            }
            _ => (DOCKER_HUB_ENDPOINT.to_string(), s),
        };

        // Tag separator is the last ':' after the last '/'
        let last_slash = remainder.rfind('/').map_or(0, |i| i + 1);
        let (image, tag) = match remainder[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&remainder[..split], &remainder[split + 1..])
            }
            None => (remainder, DEFAULT_TAG),
        };

        if image.is_empty() || tag.is_empty() || image.split('/').any(str::is_empty) {
            return Err(RegistryError::InvalidReference(s.to_string()));
        }

        let endpoint = if is_docker_hub(&endpoint) {
            DOCKER_HUB_ENDPOINT.to_string()
        } else {
            endpoint
        };
        let image = if endpoint == DOCKER_HUB_ENDPOINT {
            normalize_docker_hub_image(image)
        } else {
            image.to_string()
        };

        Ok(Self {
            endpoint,
            image,
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.endpoint, self.image, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("nginx", "index.docker.io", "library/nginx", "latest")]
    #[case("nginx:1.27", "index.docker.io", "library/nginx", "1.27")]
    #[case("bitnami/redis:7.2", "index.docker.io", "bitnami/redis", "7.2")]
    #[case("docker.io/library/alpine:3", "index.docker.io", "library/alpine", "3")]
    #[case("ghcr.io/owner/app:v1.0.0", "ghcr.io", "owner/app", "v1.0.0")]
    #[case("localhost:5000/team/app", "localhost:5000", "team/app", "latest")]
    #[case("mcr.microsoft.com/dotnet/sdk:8.0", "mcr.microsoft.com", "dotnet/sdk", "8.0")]
    fn parse_returns_expected_parts(
        #[case] input: &str,
        #[case] endpoint: &str,
        #[case] image: &str,
        #[case] tag: &str,
    ) {
        let parsed: ImageRef = input.parse().unwrap();

        assert_eq!(parsed, ImageRef::new(endpoint, image, tag));
    }

    #[rstest]
    #[case("")]
    #[case("nginx:")]
    #[case("ghcr.io//app:1")]
    #[case("nginx@sha256:abcdef")]
    fn parse_rejects_invalid_references(#[case] input: &str) {
        assert!(matches!(
            input.parse::<ImageRef>(),
            Err(RegistryError::InvalidReference(_))
        ));
    }

    #[test]
    fn display_renders_fully_qualified_reference() {
        let image = ImageRef::new("ghcr.io", "owner/app", "1.0");

        assert_eq!(image.to_string(), "ghcr.io/owner/app:1.0");
    }
}
