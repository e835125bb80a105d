use serde::{Deserialize, Serialize};

/// extended attribute (name + value)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Xattr {
    pub name: String,
    pub value: Vec<u8>,
}

impl Xattr {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// key under which tar PAX headers carry this attribute
    pub fn pax_key(&self) -> String {
        format!("{}{}", PAX_XATTR_PREFIX, self.name)
    }
}

/// PAX record prefix used for extended attributes in tar streams
pub const PAX_XATTR_PREFIX: &str = "SCHILY.xattr.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pax_key() {
        let x = Xattr::new("user.comment", b"hi".to_vec());
        assert_eq!(x.pax_key(), "SCHILY.xattr.user.comment");
    }
}
