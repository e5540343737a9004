//! Author sort keys
//!
//! Books are ordered by a key derived from their authors. The key is
//! folded (no diacritics, lower case) and uses two reserved separators:
//! one between the parts of a single author's name, and a longer one
//! between authors. Separator characters are stripped from the names
//! themselves so keys never become ambiguous.

use super::models::Author;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Joins last name and first names of one author
pub const NAME_PART_SEPARATOR: &str = ".";

/// Joins consecutive authors
pub const AUTHOR_SEPARATOR: &str = "..";

/// Fold diacritics and case, drop the reserved separator character
pub fn fold(value: &str) -> String {
    value
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .filter(|c| *c != '.')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Sort key for a single author: `last.first names`
pub fn author_key(author: &Author) -> String {
    [Some(author.last_name.as_str()), author.first_names.as_deref()]
        .into_iter()
        .flatten()
        .map(fold)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(NAME_PART_SEPARATOR)
}

/// Sort key for a book's ordered author list
pub fn author_sort_key(authors: &[Author]) -> String {
    authors
        .iter()
        .map(author_key)
        .filter(|key| !key.is_empty())
        .collect::<Vec<_>>()
        .join(AUTHOR_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_author_key() {
        assert_eq!(author_sort_key(&[Author::unknown()]), "unknown");
    }

    #[test]
    fn test_diacritics_and_case_folded() {
        let author = Author::new(Some("Gabriel García"), "Márquez");
        assert_eq!(author_key(&author), "marquez.gabriel garcia");
    }

    #[test]
    fn test_multiple_authors_use_distinct_separator() {
        let authors = vec![
            Author::new(Some("Terry"), "Pratchett"),
            Author::new(Some("Neil"), "Gaiman"),
        ];
        assert_eq!(author_sort_key(&authors), "pratchett.terry..gaiman.neil");
    }

    #[test]
    fn test_reserved_separator_stripped_from_names() {
        let author = Author::new(Some("J.R.R."), "Tolkien");
        assert_eq!(author_key(&author), "tolkien.jrr");
    }

    #[test]
    fn test_missing_first_names() {
        let authors = vec![Author::new(None, "Homer"), Author::new(Some(""), "Anon")];
        assert_eq!(author_sort_key(&authors), "homer..anon");
    }
}
