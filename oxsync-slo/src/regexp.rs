use regex::Regex;
use validator::ValidationError;

lazy_static::lazy_static! {
    // RFC 4512 attribute descriptor with optional options, e.g. `cn;lang-de`
    static ref ATTRIBUTE_REGEX: Regex = Regex::new(
        r"^[A-Za-z][A-Za-z0-9-]*(;[A-Za-z0-9-]+)*$",
    ).unwrap();

    static ref INUM_REGEX: Regex = Regex::new(
        r"^(@!)?[0-9A-Fa-f.]+(![0-9A-Fa-f.]+)*$",
    ).unwrap();
}

pub fn check_attribute_name(name: &str) -> Result<(), ValidationError> {
    if ATTRIBUTE_REGEX.is_match(name) {
        return Ok(());
    }
    Err(ValidationError::new("invalid attribute name"))
}

pub fn check_attribute_names(names: &[String]) -> Result<(), ValidationError> {
    for name in names {
        check_attribute_name(name)?;
    }
    Ok(())
}

pub fn check_inum(inum: &str) -> Result<(), ValidationError> {
    if INUM_REGEX.is_match(inum) {
        return Ok(());
    }
    Err(ValidationError::new("invalid inum"))
}
