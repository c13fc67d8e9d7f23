use super::VariantCharacterSet;
use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// A source member addressed as `[ASP/]LIB/FILE/NAME.EXT`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberParts {
    pub asp: Option<String>,
    pub library: String,
    pub file: String,
    pub name: String,
    pub extension: String,
    pub basename: String,
}

/// Parse a member path. Segments are uppercased and validated against the
/// live Local alphabet; each violated rule produces its own message.
pub fn parse_member_path(
    variants: &VariantCharacterSet,
    path: &str,
    require_extension: bool,
) -> AppResult<MemberParts> {
    let trimmed = path.strip_prefix('/').unwrap_or(path).to_uppercase();
    let parts: Vec<&str> = trimmed.split('/').collect();

    let segment = |back: usize| -> Option<&str> {
        parts
            .len()
            .checked_sub(back)
            .and_then(|index| parts.get(index))
            .copied()
            .filter(|s| !s.is_empty())
    };

    let (basename, file, library) = match (segment(1), segment(2), segment(3)) {
        (Some(basename), Some(file), Some(library)) => (basename, file, library),
        _ => {
            return Err(AppError::InvalidPath(format!(
                "Invalid path: {}. Use format LIB/SPF/NAME.ext",
                path
            )))
        }
    };
    let asp = segment(4);

    if let Some(asp) = asp {
        if !variants.is_valid_name(asp) {
            return Err(AppError::InvalidPath(format!("Invalid ASP name: {}", asp)));
        }
    }
    if !variants.is_valid_name(library) {
        return Err(AppError::InvalidPath(format!("Invalid Library name: {}", library)));
    }
    if !variants.is_valid_name(file) {
        return Err(AppError::InvalidPath(format!("Invalid Source File name: {}", file)));
    }

    let (name, extension) = match basename.rfind('.') {
        Some(dot) => (&basename[..dot], basename[dot + 1..].trim()),
        None if require_extension => {
            return Err(AppError::InvalidPath("Source Type extension is required.".to_string()))
        }
        None => (basename, ""),
    };

    if !variants.is_valid_name(name) {
        return Err(AppError::InvalidPath(format!("Invalid Source Member name: {}", name)));
    }
    // A blank extension is allowed
    if !extension.is_empty() && !variants.is_valid_name(extension) {
        return Err(AppError::InvalidPath(format!(
            "Invalid Source Member Extension: {}",
            extension
        )));
    }

    Ok(MemberParts {
        asp: asp.map(str::to_string),
        library: library.to_string(),
        file: file.to_string(),
        name: name.to_string(),
        extension: extension.to_string(),
        basename: basename.to_string(),
    })
}
