//! Top-level CMS message.

use crate::content_info::{Content, ContentInfo, ContentType};

/// A CMS message: the root [`ContentInfo`] and everything nested in it.
#[derive(Debug)]
pub struct Message {
    root: ContentInfo,
}

impl Message {
    /// Message rooted at `root`.
    pub fn new(root: ContentInfo) -> Self {
        Self { root }
    }

    /// Root `ContentInfo`.
    pub fn root(&self) -> &ContentInfo {
        &self.root
    }

    /// Mutable root `ContentInfo`.
    pub fn root_mut(&mut self) -> &mut ContentInfo {
        &mut self.root
    }

    /// Unwrap the root `ContentInfo`.
    pub fn into_root(self) -> ContentInfo {
        self.root
    }

    /// Number of nesting levels, the root included.
    pub fn content_level_count(&self) -> usize {
        let mut count = 1;
        let mut node = &self.root;
        while let Some(child) = node.child_content_info() {
            node = child;
            count += 1;
        }
        count
    }

    /// Level `n`, counting the root as level 0.
    pub fn content_level(&self, n: usize) -> Option<&ContentInfo> {
        self.root.level(n)
    }

    /// Mutable level `n`.
    pub fn content_level_mut(&mut self, n: usize) -> Option<&mut ContentInfo> {
        self.root.level_mut(n)
    }

    /// Octets of the innermost Data content.
    pub fn content(&self) -> Option<&[u8]> {
        self.root.inner_content()
    }

    /// Whether any level is SignedData.
    pub fn is_signed(&self) -> bool {
        self.any_level(|kind| kind == ContentType::SignedData)
    }

    /// Whether any level is EnvelopedData or EncryptedData.
    pub fn is_encrypted(&self) -> bool {
        self.any_level(|kind| {
            matches!(kind, ContentType::EnvelopedData | ContentType::EncryptedData)
        })
    }

    /// Whether the innermost content is missing or shorter than `min_len`.
    pub fn is_content_empty(&self, min_len: usize) -> bool {
        let mut node = &self.root;
        while let Some(child) = node.child_content_info() {
            node = child;
        }
        match node.content() {
            _ if node.is_detached() => true,
            Content::Data(bytes) | Content::Unknown(bytes) => bytes.len() < min_len,
            _ => true,
        }
    }

    fn any_level(&self, pred: impl Fn(ContentType) -> bool) -> bool {
        (0..self.content_level_count())
            .filter_map(|n| self.content_level(n))
            .any(|level| pred(level.kind()))
    }
}

impl From<ContentInfo> for Message {
    fn from(root: ContentInfo) -> Self {
        Self::new(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ContentEncryptionAlgorithm;
    use crate::{EnvelopedData, SignedData};

    #[test]
    fn level_helpers() {
        let data = Message::new(ContentInfo::data(b"abc".to_vec()));
        assert_eq!(data.content_level_count(), 1);
        assert!(!data.is_signed());
        assert!(!data.is_encrypted());
        assert!(!data.is_content_empty(3));
        assert!(data.is_content_empty(4));

        let enveloped = EnvelopedData::new(
            ContentInfo::data(b"abc".to_vec()),
            ContentEncryptionAlgorithm::Aes128Cbc,
        );
        let nested = Message::from(ContentInfo::signed(SignedData::new(
            ContentInfo::enveloped(enveloped),
        )));
        assert_eq!(nested.content_level_count(), 3);
        assert!(nested.is_signed());
        assert!(nested.is_encrypted());
        assert_eq!(
            nested.content_level(1).map(ContentInfo::kind),
            Some(ContentType::EnvelopedData)
        );
        assert_eq!(nested.content(), Some(&b"abc"[..]));
        assert!(nested.content_level(3).is_none());
    }

    #[test]
    fn detached_content_is_empty() {
        let msg = Message::new(ContentInfo::signed(SignedData::new(
            ContentInfo::detached_data(),
        )));
        assert!(msg.is_content_empty(0));
        assert_eq!(msg.content(), None);
    }
}
