//! Canonical ordering of `SET OF` elements.
//!
//! Elements are ordered by the length of their encoding first, then byte by
//! byte. Sorting is stable, so equal encodings keep their relative order, and
//! any companion arrays are permuted together with the primary one.

use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::errors::{Error, Result};

/// Canonical comparison of two encodings.
pub fn compare_encodings(a: &[u8], b: &[u8]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Sort already-encoded elements in place.
pub fn sort_encodings(items: &mut [Vec<u8>]) {
    items.sort_by(|a, b| compare_encodings(a, b));
}

/// Sort `items` by the encoding `encode` produces for each of them.
pub fn sort_by_encoding<T, F>(items: &mut Vec<T>, encode: F) -> Result<()>
where
    F: FnMut(&T) -> Result<Vec<u8>>,
{
    sort_by_encoding_with::<T, (), F>(items, encode, &mut [])
}

/// Sort `items` by encoding and apply the same permutation to every
/// companion array.
///
/// Each companion must have exactly as many entries as `items`.
pub fn sort_by_encoding_with<T, U, F>(
    items: &mut Vec<T>,
    mut encode: F,
    companions: &mut [&mut Vec<U>],
) -> Result<()>
where
    F: FnMut(&T) -> Result<Vec<u8>>,
{
    if companions.iter().any(|c| c.len() != items.len()) {
        return Err(Error::InvalidArgument("companion array length differs from items"));
    }
    if items.len() < 2 {
        return Ok(());
    }

    let encodings = items
        .iter()
        .map(&mut encode)
        .collect::<Result<Vec<_>>>()?;

    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|&a, &b| compare_encodings(&encodings[a], &encodings[b]));
    if order.iter().enumerate().all(|(i, &j)| i == j) {
        return Ok(());
    }

    permute(items, &order);
    for companion in companions.iter_mut() {
        permute(companion, &order);
    }
    Ok(())
}

fn permute<T>(items: &mut Vec<T>, order: &[usize]) {
    let mut slots: Vec<Option<T>> = items.drain(..).map(Some).collect();
    items.extend(order.iter().filter_map(|&i| slots[i].take()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(item: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(item.clone())
    }

    #[test]
    fn shorter_encodings_sort_first() {
        let mut items = vec![vec![0x30, 0x02, 1, 1], vec![0xff], vec![0x30, 0x01, 9]];
        sort_by_encoding(&mut items, identity).unwrap();
        assert_eq!(
            items,
            vec![vec![0xff], vec![0x30, 0x01, 9], vec![0x30, 0x02, 1, 1]]
        );
    }

    #[test]
    fn companions_follow_items() {
        let mut items = vec![vec![3u8], vec![1], vec![2]];
        let mut names = vec!["three", "one", "two"];
        let mut sizes = vec![30, 10, 20];
        {
            let mut companions: [&mut Vec<_>; 1] = [&mut names];
            sort_by_encoding_with(&mut items, identity, &mut companions).unwrap();
        }
        assert_eq!(names, ["one", "two", "three"]);

        // sizes was not a companion
        assert_eq!(sizes, [30, 10, 20]);
        let mut items = vec![vec![3u8], vec![1], vec![2]];
        sort_by_encoding_with(&mut items, identity, &mut [&mut sizes]).unwrap();
        assert_eq!(sizes, [10, 20, 30]);
    }

    #[test]
    fn equal_encodings_keep_their_order() {
        let mut items = vec![(1, vec![5u8]), (2, vec![4u8]), (3, vec![5u8])];
        sort_by_encoding(&mut items, |(_, enc)| Ok(enc.clone())).unwrap();
        let ids: Vec<_> = items.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, [2, 1, 3]);
    }

    #[test]
    fn mismatched_companion_is_rejected() {
        let mut items = vec![vec![1u8], vec![0u8]];
        let mut short = vec![1];
        assert_eq!(
            sort_by_encoding_with(&mut items, identity, &mut [&mut short]),
            Err(Error::InvalidArgument("companion array length differs from items"))
        );
    }

    #[test]
    fn trivial_inputs() {
        let mut empty: Vec<Vec<u8>> = Vec::new();
        sort_by_encoding(&mut empty, identity).unwrap();
        let mut one = vec![vec![7u8]];
        sort_by_encoding(&mut one, |_| Err(Error::InvalidState("not called"))).unwrap();
        assert_eq!(one, [vec![7u8]]);
    }
}
