//! Sentence segmentation
//!
//! A rule-based splitter: a sentence ends at `.`, `!` or `?` (plus closing
//! quotes/brackets) followed by whitespace and an uppercase letter, a digit
//! or an opening bracket. Periods after common abbreviations and single
//! letter initials do not end a sentence. Sentences crossed by an
//! annotation are merged until every annotation fits in one sentence.

use super::{Annotation, Document, Passage, FLAG_CROSSING_SENTENCE, FLAG_SEGMENTATION_FAILED};

/// Lowercased tokens (without the final period) that never end a sentence
const ABBREVIATIONS: &[&str] = &[
    "al", "approx", "ca", "cf", "co", "dr", "e.g", "eg", "et", "etc", "fig", "figs", "i.e", "ie",
    "inc", "jr", "ltd", "mr", "mrs", "ms", "no", "nos", "prof", "ref", "refs", "resp", "sp", "spp",
    "sr", "st", "subsp", "tab", "var", "viz", "vol", "vs",
];

/// `[start, end)` character spans of the sentences of `text`, trimmed of
/// surrounding whitespace
pub fn sentence_spans(text: &[char]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = skip_whitespace(text, 0);
    let mut i = start;

    while i < text.len() {
        if matches!(text[i], '.' | '!' | '?') {
            let mut end = i + 1;
            while end < text.len() && matches!(text[end], '"' | '\'' | ')' | ']' | '”' | '’') {
                end += 1;
            }
            let next = skip_whitespace(text, end);
            let has_space = next > end;
            let opens_sentence = next < text.len()
                && (text[next].is_uppercase() || text[next].is_ascii_digit() || matches!(text[next], '(' | '[' | '"'));
            if has_space && opens_sentence && !(text[i] == '.' && is_abbreviation(text, start, i)) {
                spans.push((start, end));
                start = next;
                i = next;
                continue;
            }
        }
        i += 1;
    }

    let end = trim_end(text, text.len());
    if start < end {
        spans.push((start, end));
    }
    spans
}

fn skip_whitespace(text: &[char], mut i: usize) -> usize {
    while i < text.len() && text[i].is_whitespace() {
        i += 1;
    }
    i
}

fn trim_end(text: &[char], mut end: usize) -> usize {
    while end > 0 && text[end - 1].is_whitespace() {
        end -= 1;
    }
    end
}

/// True if the token ending at the period `dot` is an abbreviation or an initial
fn is_abbreviation(text: &[char], sentence_start: usize, dot: usize) -> bool {
    let mut token_start = dot;
    while token_start > sentence_start && !text[token_start - 1].is_whitespace() && text[token_start - 1] != '(' {
        token_start -= 1;
    }
    let token: String = text[token_start..dot].iter().collect();
    if token.chars().count() == 1 && token.chars().all(char::is_alphabetic) {
        return true;
    }
    ABBREVIATIONS.contains(&token.to_lowercase().as_str())
}

/// Merge neighbouring spans until every `[start, end)` in `annotations`
/// lies inside a single span. Returns the spans and, per span, whether it
/// was produced by a merge.
pub fn merge_crossing(
    mut spans: Vec<(usize, usize)>,
    annotations: &[(usize, usize)],
) -> (Vec<(usize, usize)>, Vec<bool>) {
    let mut merged = vec![false; spans.len()];

    loop {
        let mut changed = false;
        for &(a_start, a_end) in annotations {
            let first = spans.iter().position(|&(_, end)| end > a_start);
            let last = spans.iter().rposition(|&(start, _)| start < a_end.max(a_start + 1));
            let (Some(first), Some(last)) = (first, last) else {
                continue;
            };
            // an annotation starting or ending in the gap between two
            // sentences also widens the span
            let (lo, hi) = (first.min(last), first.max(last));
            let widened = (spans[lo].0.min(a_start), spans[hi].1.max(a_end));
            if hi > lo || widened != spans[lo] {
                let was_merged = hi > lo || merged[lo];
                spans.splice(lo..=hi, [widened]);
                merged.splice(lo..=hi, [was_merged]);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    (spans, merged)
}

/// Split every passage of `document` into sentences.
///
/// Annotation offsets become relative to their sentence. If an annotation
/// cannot be placed, or offsets do not validate afterwards, the original
/// document is returned flagged `segmentation_failed`.
pub fn segment_document(document: Document) -> Document {
    match try_segment(&document) {
        Some(segmented) if segmented.offset_errors().is_empty() => segmented,
        _ => {
            let mut failed = document;
            if !failed.flags.iter().any(|f| f == FLAG_SEGMENTATION_FAILED) {
                failed.flags.push(FLAG_SEGMENTATION_FAILED.to_string());
            }
            failed
        }
    }
}

fn try_segment(document: &Document) -> Option<Document> {
    if document.sentences {
        return Some(document.clone());
    }

    let mut sentences = Vec::new();
    for passage in &document.passages {
        let chars: Vec<char> = passage.text.chars().collect();
        let relative: Vec<(usize, usize)> = passage
            .annotations
            .iter()
            .map(|a| Some((a.start.checked_sub(passage.offset)?, a.end.checked_sub(passage.offset)?)))
            .collect::<Option<_>>()?;
        if relative.iter().any(|&(start, end)| end > chars.len() || start > end) {
            return None;
        }

        let (spans, merged) = merge_crossing(sentence_spans(&chars), &relative);

        let mut placed = 0;
        for ((start, end), was_merged) in spans.into_iter().zip(merged) {
            let annotations: Vec<Annotation> = passage
                .annotations
                .iter()
                .zip(&relative)
                .filter(|(_, span)| span.0 >= start && span.1 <= end)
                .map(|(a, &(a_start, a_end))| {
                    let mut a = a.clone();
                    a.start = a_start - start;
                    a.end = a_end - start;
                    if was_merged {
                        a.flags.push(FLAG_CROSSING_SENTENCE.to_string());
                    }
                    a
                })
                .collect();
            placed += annotations.len();

            sentences.push(Passage {
                id: sentences.len(),
                kind: passage.kind.clone(),
                offset: passage.offset + start,
                text: chars[start..end].iter().collect(),
                annotations,
                flags: if was_merged {
                    vec![FLAG_CROSSING_SENTENCE.to_string()]
                } else {
                    Vec::new()
                },
            });
        }

        if placed != passage.annotations.len() {
            return None;
        }
    }

    Some(Document {
        id: document.id.clone(),
        passages: sentences,
        sentences: true,
        flags: document.flags.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Category;

    fn spans(text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        sentence_spans(&chars)
            .into_iter()
            .map(|(s, e)| chars[s..e].iter().collect())
            .collect()
    }

    fn annotation(start: usize, end: usize, text: &str) -> Annotation {
        Annotation {
            id: "0".into(),
            start,
            end,
            text: text.into(),
            category: Category::Gene,
            identifiers: vec!["G1".into()],
            original_identifiers: "G1".into(),
            flags: Vec::new(),
        }
    }

    fn document(text: &str, annotations: Vec<Annotation>) -> Document {
        Document {
            id: "1".into(),
            passages: vec![Passage {
                id: 0,
                kind: "abstract".into(),
                offset: 0,
                text: text.into(),
                annotations,
                flags: Vec::new(),
            }],
            sentences: false,
            flags: Vec::new(),
        }
    }

    #[test]
    fn test_basic_split() {
        assert_eq!(
            spans("First sentence. Second one! Third? 4 is a number."),
            vec!["First sentence.", "Second one!", "Third?", "4 is a number."]
        );
    }

    #[test]
    fn test_abbreviations_and_initials() {
        assert_eq!(
            spans("Shown by Smith et al. In Fig. 2 and J. Doe e.g. Here. Done."),
            vec!["Shown by Smith et al. In Fig. 2 and J. Doe e.g. Here.", "Done."]
        );
        assert_eq!(spans("lowercase. after period"), vec!["lowercase. after period"]);
    }

    #[test]
    fn test_single_sentence_keeps_span() {
        let text = "The BRCA1 gene is linked to cancer.";
        let segmented = segment_document(document(text, vec![annotation(4, 9, "BRCA1")]));

        assert!(segmented.sentences);
        assert!(segmented.flags.is_empty());
        assert_eq!(segmented.passages.len(), 1);
        let a = &segmented.passages[0].annotations[0];
        assert_eq!((a.start, a.end), (4, 9));
        assert_eq!(a.identifiers, vec!["G1"]);
        assert!(a.flags.is_empty());
    }

    #[test]
    fn test_crossing_annotation_merges_sentences() {
        let text = "Loss of Ab. C protein. Next one. Last.";
        let segmented = segment_document(document(text, vec![annotation(8, 21, "Ab. C protein")]));

        assert_eq!(segmented.passages.len(), 3);
        assert_eq!(segmented.passages[0].text, "Loss of Ab. C protein.");
        assert_eq!(segmented.passages[0].flags, vec![FLAG_CROSSING_SENTENCE]);
        let a = &segmented.passages[0].annotations[0];
        assert_eq!(a.flags, vec![FLAG_CROSSING_SENTENCE]);
        assert_eq!(segmented.annotation_count(), 1);
    }

    #[test]
    fn test_sentence_offsets_are_relative() {
        let text = "Nothing here. The BRCA1 gene.";
        let segmented = segment_document(document(text, vec![annotation(18, 23, "BRCA1")]));
        let second = &segmented.passages[1];
        assert_eq!(second.offset, 14);
        assert_eq!((second.annotations[0].start, second.annotations[0].end), (4, 9));
    }

    #[test]
    fn test_bad_offsets_flag_failure() {
        let text = "One. Two.";
        let segmented = segment_document(document(text, vec![annotation(0, 3, "Two")]));
        assert!(!segmented.sentences);
        assert_eq!(segmented.flags, vec![FLAG_SEGMENTATION_FAILED]);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn spans_are_ordered_and_in_bounds(text in "[A-Za-z0-9 .!?]{0,120}") {
                let chars: Vec<char> = text.chars().collect();
                let spans = sentence_spans(&chars);
                let mut previous_end = 0;
                for (start, end) in spans {
                    prop_assert!(start < end);
                    prop_assert!(end <= chars.len());
                    prop_assert!(start >= previous_end);
                    previous_end = end;
                }
            }

            #[test]
            fn segmentation_preserves_annotation_count(
                text in "[A-Z][a-z]{1,8}( [a-z]{1,8}){0,4}\\. [A-Z][a-z]{1,8}( [a-z]{1,8}){0,4}\\.",
                start in 0usize..40,
                len in 1usize..12,
            ) {
                let chars: Vec<char> = text.chars().collect();
                let start = start.min(chars.len() - 1);
                let end = (start + len).min(chars.len());
                let surface: String = chars[start..end].iter().collect();
                let segmented = segment_document(document(&text, vec![annotation(start, end, &surface)]));
                prop_assert_eq!(segmented.annotation_count(), 1);
                prop_assert!(segmented.offset_errors().is_empty());
            }
        }
    }
}
