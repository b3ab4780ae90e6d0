//! Utility functions shared by the fetcher, parser and scheduler.
//!
//! - **URL validation**: security policy for dereferencing untrusted feed URLs (SSRF)
//! - **Text processing**: markup stripping, entity decoding and image extraction
//!
//! # Examples
//!
//! ```
//! use feedbower::util::{extract_image, normalize};
//!
//! let body = r#"<p>Launch <b>day</b></p><img src="https://cdn.example.com/hero.png">"#;
//! assert_eq!(normalize(body), "Launch day");
//! assert_eq!(extract_image(body).as_deref(), Some("https://cdn.example.com/hero.png"));
//! ```

mod text;
mod url_validator;

pub use text::{extract_image, normalize, truncate_content};
pub use url_validator::{
    check_url_syntax, resolve_allowed, validate_url, Cidr, CidrParseError, Resolver,
    SecurityPolicy, SecurityViolation, StaticResolver, SystemResolver, UrlValidator,
    DEFAULT_ALLOWED_PORTS, DEFAULT_BLOCKED_HOSTS, DEFAULT_BLOCKED_NETWORKS, MAX_URL_LENGTH,
};
