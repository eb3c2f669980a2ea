use std::fmt::Debug;

use ssh_encoding::{Decode, Encode};

/// An RFC 4251 `name-list`: one string of comma-separated names.
#[derive(Clone, Default, PartialEq, Eq)]
pub(crate) struct NameList(pub Vec<String>);

impl Debug for NameList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl NameList {
    pub(crate) fn of<N: AsRef<str>>(names: &[N]) -> Self {
        NameList(names.iter().map(|n| n.as_ref().to_owned()).collect())
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }

    pub(crate) fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|n| n == name)
    }

    fn as_encoded_string(&self) -> String {
        self.0.join(",")
    }

    /// An empty string is an empty list.
    fn from_encoded_string(value: &str) -> Self {
        NameList(
            value
                .split(',')
                .filter(|name| !name.is_empty())
                .map(str::to_owned)
                .collect(),
        )
    }
}

impl Encode for NameList {
    fn encoded_len(&self) -> Result<usize, ssh_encoding::Error> {
        self.as_encoded_string().encoded_len()
    }

    fn encode(&self, writer: &mut impl ssh_encoding::Writer) -> Result<(), ssh_encoding::Error> {
        self.as_encoded_string().encode(writer)
    }
}

impl Decode for NameList {
    type Error = ssh_encoding::Error;

    fn decode(reader: &mut impl ssh_encoding::Reader) -> Result<Self, ssh_encoding::Error> {
        let s = String::decode(reader)?;
        Ok(Self::from_encoded_string(&s))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn names_are_joined_in_one_string() {
        let mut buf = Vec::new();
        NameList::of(&["aes128-ctr", "aes256-ctr"]).encode(&mut buf).unwrap();
        let mut expected = 21u32.to_be_bytes().to_vec();
        expected.extend_from_slice(b"aes128-ctr,aes256-ctr");
        assert_eq!(buf, expected);

        buf.clear();
        NameList::default().encode(&mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 0]);
    }

    #[test]
    fn empty_entries_are_dropped() {
        let mut r: &[u8] = b"\0\0\0\x05a,,b,\0\0\0\0";
        assert_eq!(NameList::decode(&mut r).unwrap().0, ["a", "b"]);
        assert!(NameList::decode(&mut r).unwrap().0.is_empty());
    }
}
