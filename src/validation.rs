//! Explicit validator functions per input type (spec.md §9: no
//! decorator/attribute-driven validation metaprogramming).

use crate::error::AppError;

pub const TITLE_MIN: usize = 1;
pub const TITLE_MAX: usize = 200;
pub const CONTENT_MIN: usize = 1;
pub const CONTENT_MAX: usize = 10_000;
pub const PAGE_SIZE_DEFAULT: u32 = 50;
pub const PAGE_SIZE_MAX: u32 = 100;

pub fn validate_title(title: &str) -> Result<(), AppError> {
    let len = title.chars().count();
    if len < TITLE_MIN || len > TITLE_MAX {
        return Err(AppError::InvalidArgument(format!(
            "title must be {TITLE_MIN}..{TITLE_MAX} characters, got {len}"
        )));
    }
    Ok(())
}

pub fn validate_content(content: &str) -> Result<(), AppError> {
    let len = content.chars().count();
    if len < CONTENT_MIN || len > CONTENT_MAX {
        return Err(AppError::InvalidArgument(format!(
            "message content must be {CONTENT_MIN}..{CONTENT_MAX} characters, got {len}"
        )));
    }
    Ok(())
}

/// Clamp a requested page size to `[1, 100]`, per spec.md §4.2.
pub fn clamp_page_size(requested: Option<u32>) -> Result<u32, AppError> {
    match requested {
        None => Ok(PAGE_SIZE_DEFAULT),
        Some(0) => Err(AppError::InvalidArgument("pageSize must be >= 1".to_string())),
        Some(n) => Ok(n.min(PAGE_SIZE_MAX)),
    }
}

pub fn validate_list_limit(requested: Option<u32>, default: u32) -> u32 {
    requested.unwrap_or(default).clamp(1, PAGE_SIZE_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// `clamp_page_size` either rejects (0) or returns a value in
        /// `[1, PAGE_SIZE_MAX]`, never echoing an out-of-range request back.
        #[test]
        fn clamp_page_size_stays_in_bounds(requested in 0u32..10_000) {
            match clamp_page_size(Some(requested)) {
                Ok(n) => prop_assert!((1..=PAGE_SIZE_MAX).contains(&n)),
                Err(_) => prop_assert_eq!(requested, 0),
            }
        }

        /// `validate_list_limit` always lands in `[1, PAGE_SIZE_MAX]`
        /// regardless of the requested value or default.
        #[test]
        fn validate_list_limit_stays_in_bounds(
            requested in proptest::option::of(0u32..10_000),
            default in 1u32..=PAGE_SIZE_MAX,
        ) {
            let n = validate_list_limit(requested, default);
            prop_assert!((1..=PAGE_SIZE_MAX).contains(&n));
        }
    }

    #[test]
    fn title_boundary() {
        assert!(validate_title(&"a".repeat(0)).is_err());
        assert!(validate_title(&"a".repeat(1)).is_ok());
        assert!(validate_title(&"a".repeat(200)).is_ok());
        assert!(validate_title(&"a".repeat(201)).is_err());
    }

    #[test]
    fn content_boundary() {
        assert!(validate_content(&"a".repeat(0)).is_err());
        assert!(validate_content(&"a".repeat(1)).is_ok());
        assert!(validate_content(&"a".repeat(10_000)).is_ok());
        assert!(validate_content(&"a".repeat(10_001)).is_err());
    }

    #[test]
    fn page_size_clamped() {
        assert!(clamp_page_size(Some(0)).is_err());
        assert_eq!(clamp_page_size(Some(500)).unwrap(), 100);
        assert_eq!(clamp_page_size(None).unwrap(), 50);
        assert_eq!(clamp_page_size(Some(1)).unwrap(), 1);
    }
}
