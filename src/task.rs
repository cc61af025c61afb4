pub mod dataset;
pub mod registry;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{EvalError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkFamily {
    Mcqa,
    OpenQa,
    Code,
    Translation,
    MultiTurn,
}

impl BenchmarkFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            BenchmarkFamily::Mcqa => "mcqa",
            BenchmarkFamily::OpenQa => "open_qa",
            BenchmarkFamily::Code => "code",
            BenchmarkFamily::Translation => "translation",
            BenchmarkFamily::MultiTurn => "multi_turn",
        }
    }

    /// Families whose outputs are graded by a judge model.
    pub fn uses_checker(&self) -> bool {
        matches!(
            self,
            BenchmarkFamily::Mcqa | BenchmarkFamily::OpenQa | BenchmarkFamily::MultiTurn
        )
    }
}

impl fmt::Display for BenchmarkFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub key: String,
    pub display_name: String,
    #[serde(default)]
    pub group: String,
}

impl Category {
    pub fn new(key: &str, display_name: &str, group: &str) -> Self {
        Self {
            key: key.to_string(),
            display_name: display_name.to_string(),
            group: group.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McqaExample {
    pub question: String,
    pub options: Vec<String>,
    /// Gold option, either as a letter label (`A` is the first option) or
    /// as a 1-based number (`1` is the first option).
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenQaExample {
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeExample {
    pub task_id: String,
    pub prompt: String,
    pub test: String,
    #[serde(default)]
    pub canonical_solution: String,
    pub entry_point: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiTurnExample {
    pub questions: Vec<String>,
    #[serde(default)]
    pub references: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationExample {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Example {
    Mcqa(McqaExample),
    OpenQa(OpenQaExample),
    Code(CodeExample),
    MultiTurn(MultiTurnExample),
    Translation(TranslationExample),
}

impl Example {
    pub fn family(&self) -> BenchmarkFamily {
        match self {
            Example::Mcqa(_) => BenchmarkFamily::Mcqa,
            Example::OpenQa(_) => BenchmarkFamily::OpenQa,
            Example::Code(_) => BenchmarkFamily::Code,
            Example::MultiTurn(_) => BenchmarkFamily::MultiTurn,
            Example::Translation(_) => BenchmarkFamily::Translation,
        }
    }

    /// Parse one dataset record in the shape of `family`.
    pub fn from_record(family: BenchmarkFamily, line: &str) -> Result<Self> {
        let example = match family {
            BenchmarkFamily::Mcqa => Example::Mcqa(serde_json::from_str(line)?),
            BenchmarkFamily::OpenQa => Example::OpenQa(serde_json::from_str(line)?),
            BenchmarkFamily::Code => Example::Code(serde_json::from_str(line)?),
            BenchmarkFamily::MultiTurn => Example::MultiTurn(serde_json::from_str(line)?),
            BenchmarkFamily::Translation => Example::Translation(serde_json::from_str(line)?),
        };
        if let Example::Mcqa(ref e) = example {
            if e.options.len() > MAX_OPTIONS {
                return Err(EvalError::Dataset(format!(
                    "{} options, at most {} can be labelled",
                    e.options.len(),
                    MAX_OPTIONS
                )));
            }
        }
        Ok(example)
    }

    /// Texts a translator has to carry into another language, in a fixed
    /// order: the question first, then MCQA options.
    pub fn source_texts(&self) -> Vec<&str> {
        match self {
            Example::Mcqa(e) => std::iter::once(e.question.as_str())
                .chain(e.options.iter().map(String::as_str))
                .collect(),
            Example::OpenQa(e) => vec![e.question.as_str()],
            Example::Code(e) => vec![e.prompt.as_str()],
            Example::MultiTurn(e) => e.questions.iter().map(String::as_str).collect(),
            Example::Translation(e) => vec![e.source.as_str()],
        }
    }

    /// The user-facing question turns, which is what a transcript shows.
    pub fn question_turns(&self) -> Vec<&str> {
        match self {
            Example::MultiTurn(e) => e.questions.iter().map(String::as_str).collect(),
            Example::Mcqa(e) => vec![e.question.as_str()],
            other => other.source_texts().into_iter().take(1).collect(),
        }
    }

    /// Copy of this example with its source texts replaced, in the order
    /// returned by [`Example::source_texts`].
    pub fn with_source_texts(&self, texts: Vec<String>) -> Result<Self> {
        let expected = self.source_texts().len();
        if texts.len() != expected {
            return Err(EvalError::Dataset(format!(
                "expected {} translated texts, got {}",
                expected,
                texts.len()
            )));
        }
        let mut texts = texts.into_iter();
        let mut next = || texts.next().unwrap_or_default();

        Ok(match self {
            Example::Mcqa(e) => {
                let question = next();
                let options = e.options.iter().map(|_| next()).collect();
                Example::Mcqa(McqaExample {
                    question,
                    options,
                    answer: e.answer.clone(),
                })
            }
            Example::OpenQa(e) => Example::OpenQa(OpenQaExample {
                question: next(),
                ..e.clone()
            }),
            Example::Code(e) => Example::Code(CodeExample {
                prompt: next(),
                ..e.clone()
            }),
            Example::MultiTurn(e) => Example::MultiTurn(MultiTurnExample {
                questions: e.questions.iter().map(|_| next()).collect(),
                references: e.references.clone(),
            }),
            Example::Translation(e) => Example::Translation(TranslationExample {
                source: next(),
                target: e.target.clone(),
            }),
        })
    }
}

/// Options are labelled `A` through `Z`.
pub const MAX_OPTIONS: usize = 26;

pub fn option_label(index: usize) -> Result<String> {
    if index >= MAX_OPTIONS {
        return Err(EvalError::Dataset(format!(
            "option {} has no label, at most {} options are supported",
            index + 1,
            MAX_OPTIONS
        )));
    }
    Ok(((b'A' + index as u8) as char).to_string())
}

impl McqaExample {
    /// 0-based index of the gold option. Numeric answers are 1-based.
    pub fn gold_index(&self) -> Option<usize> {
        let label = self.answer.trim();
        let idx = match label.parse::<usize>() {
            Ok(n) => n.checked_sub(1)?,
            Err(_) => {
                let mut chars = label.chars();
                let c = chars.next()?.to_ascii_uppercase();
                if chars.next().is_some() || !c.is_ascii_uppercase() {
                    return None;
                }
                (c as u8 - b'A') as usize
            }
        };
        (idx < self.options.len()).then_some(idx)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub family: BenchmarkFamily,
    pub split: String,
    pub source_language: String,
    #[serde(default)]
    pub target_language: Option<String>,
    pub categories: Vec<Category>,
}

impl Task {
    pub fn is_cross_language(&self) -> bool {
        matches!(self.target_language, Some(ref t) if t != &self.source_language)
    }

    /// Language the inference model is prompted in.
    pub fn inference_language(&self) -> &str {
        self.target_language
            .as_deref()
            .unwrap_or(&self.source_language)
    }

    /// category key → group, categories without a group map to themselves.
    pub fn groups(&self) -> BTreeMap<String, String> {
        self.categories
            .iter()
            .map(|c| {
                let group = if c.group.is_empty() {
                    c.key.clone()
                } else {
                    c.group.clone()
                };
                (c.key.clone(), group)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mcqa() -> Example {
        Example::Mcqa(McqaExample {
            question: "2+2?".into(),
            options: vec!["3".into(), "4".into()],
            answer: "B".into(),
        })
    }

    #[test]
    fn test_from_record_per_family() {
        let ex = Example::from_record(
            BenchmarkFamily::OpenQa,
            r#"{"question":"q","answer":"a"}"#,
        )
        .unwrap();
        assert_eq!(ex.family(), BenchmarkFamily::OpenQa);

        assert!(Example::from_record(BenchmarkFamily::Mcqa, r#"{"question":"q"}"#).is_err());
    }

    #[test]
    fn test_source_texts_replacement() {
        let ex = mcqa();
        assert_eq!(ex.source_texts(), vec!["2+2?", "3", "4"]);
        assert_eq!(ex.question_turns(), vec!["2+2?"]);

        let translated = ex
            .with_source_texts(vec!["이+이?".into(), "삼".into(), "사".into()])
            .unwrap();
        match translated {
            Example::Mcqa(m) => {
                assert_eq!(m.question, "이+이?");
                assert_eq!(m.options, vec!["삼", "사"]);
                assert_eq!(m.answer, "B");
            }
            other => panic!("wrong family {:?}", other),
        }

        assert!(ex.with_source_texts(vec!["only one".into()]).is_err());
    }

    #[test]
    fn test_gold_index() {
        let m = McqaExample {
            question: "q".into(),
            options: vec!["a".into(), "b".into(), "c".into()],
            answer: "c".into(),
        };
        assert_eq!(m.gold_index(), Some(2));

        let out_of_range = McqaExample {
            answer: "E".into(),
            ..m.clone()
        };
        assert_eq!(out_of_range.gold_index(), None);
        assert_eq!(option_label(0).unwrap(), "A");
        assert_eq!(option_label(3).unwrap(), "D");
        assert_eq!(option_label(25).unwrap(), "Z");
        assert!(option_label(26).is_err());
    }

    #[test]
    fn test_gold_index_numeric_is_one_based() {
        let m = McqaExample {
            question: "q".into(),
            options: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            answer: "1".into(),
        };
        assert_eq!(m.gold_index(), Some(0));

        let last = McqaExample {
            answer: "4".into(),
            ..m.clone()
        };
        assert_eq!(last.gold_index(), Some(3));

        for bad in ["0", "5"] {
            let e = McqaExample {
                answer: bad.into(),
                ..m.clone()
            };
            assert_eq!(e.gold_index(), None, "{}", bad);
        }
    }

    #[test]
    fn test_from_record_rejects_unlabelled_options() {
        let options: Vec<String> = (0..27).map(|i| format!("o{}", i)).collect();
        let line = serde_json::json!({"question": "q", "options": options, "answer": "A"}).to_string();
        let err = Example::from_record(BenchmarkFamily::Mcqa, &line).unwrap_err();
        assert!(matches!(err, EvalError::Dataset(_)));

        let line = serde_json::json!({"question": "q", "options": &options[..26], "answer": "Z"}).to_string();
        assert!(Example::from_record(BenchmarkFamily::Mcqa, &line).is_ok());
    }

    #[test]
    fn test_task_language_mode() {
        let mut task = Task {
            name: "mmlu".into(),
            family: BenchmarkFamily::Mcqa,
            split: "test".into(),
            source_language: "en".into(),
            target_language: None,
            categories: vec![
                Category::new("anatomy", "Anatomy", "other"),
                Category::new("virology", "Virology", ""),
            ],
        };
        assert!(!task.is_cross_language());
        assert_eq!(task.inference_language(), "en");

        task.target_language = Some("en".into());
        assert!(!task.is_cross_language());

        task.target_language = Some("ko".into());
        assert!(task.is_cross_language());
        assert_eq!(task.inference_language(), "ko");

        let groups = task.groups();
        assert_eq!(groups["anatomy"], "other");
        assert_eq!(groups["virology"], "virology");
    }
}
