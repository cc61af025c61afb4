//! Prompt formatting for inference, judging and translation.
//!
//! Templates are pure data: strings with `{placeholder}` slots, one set per
//! (family, language). [`FamilyTemplates`] turns examples into messages.

pub mod registry;

pub use registry::TemplateRegistry;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::client::{Message, Role};
use crate::dispatcher::{Completion, JobPayload};
use crate::error::{EvalError, Result};
use crate::task::{option_label, BenchmarkFamily, Example, McqaExample, TranslationExample};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTemplates {
    /// Placeholders: `{question}`, `{options}`, `{prompt}`, `{source}`.
    pub inference: String,
    /// Assistant turn for a few-shot example: `{answer}`, `{explanation}`.
    pub shot_answer: String,
    /// Placeholders: `{question}`, `{options}`, `{candidate}`, `{response}`,
    /// `{reference}`, `{explanation}`, `{conversation}`.
    pub checker: String,
    pub checker_system: Option<String>,
    /// Placeholders: `{source_language}`, `{target_language}`.
    pub translation_system: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            inference: "{question}".to_string(),
            shot_answer: "{answer}".to_string(),
            checker: "Question:\n{question}\n\nReference answer:\n{reference}\n\nResponse:\n{response}\n\nIs the response correct? Reply with exactly one word: true, false or unknown.".to_string(),
            checker_system: Some("You are a strict grader.".to_string()),
            translation_system: "Translate the user's message from {source_language} to {target_language}. Reply with the translation only.".to_string(),
        }
    }
}

impl PromptTemplates {
    pub fn for_family(family: BenchmarkFamily) -> Self {
        let base = Self::default();
        match family {
            BenchmarkFamily::Mcqa => Self {
                inference: "Answer the following multiple choice question.\n\n{question}\n\n{options}\n\nAnswer:".to_string(),
                shot_answer: "{answer}".to_string(),
                checker: "Question:\n{question}\n\n{options}\n\nResponse:\n{response}\n\nDoes the response select option {candidate}? Reply with exactly one word: true or false.".to_string(),
                ..base
            },
            BenchmarkFamily::OpenQa => Self {
                inference: "Solve the following problem. End with the final answer.\n\n{question}".to_string(),
                shot_answer: "{explanation}\nThe answer is {answer}.".to_string(),
                ..base
            },
            BenchmarkFamily::Code => Self {
                inference: "Complete the following Python function. Return the full function in a single code block.\n\n```python\n{prompt}\n```".to_string(),
                ..base
            },
            BenchmarkFamily::MultiTurn => Self {
                inference: "{question}".to_string(),
                checker: "Conversation:\n{conversation}\n\nReference answers:\n{reference}\n\nDid the assistant answer every turn correctly and helpfully? Reply with exactly one word: true, false or unknown.".to_string(),
                ..base
            },
            BenchmarkFamily::Translation => Self {
                inference: "{source}".to_string(),
                shot_answer: "{answer}".to_string(),
                ..base
            },
        }
    }
}

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-z_]+)\}").expect("placeholder pattern is valid"))
}

/// Substitute `{key}` slots in one pass. Unknown slots are left as written,
/// and substituted text is never rescanned.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures| {
            let key = &caps[1];
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn render_options(options: &[String]) -> Result<String> {
    let lines = options
        .iter()
        .enumerate()
        .map(|(i, o)| Ok(format!("{}. {}", option_label(i)?, o)))
        .collect::<Result<Vec<_>>>()?;
    Ok(lines.join("\n"))
}

fn render_conversation(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| match m.role {
            Role::User => format!("User: {}", m.content),
            _ => format!("Assistant: {}", m.content),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// One judge request and, for MCQA, whether its candidate is the gold option.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckerJob {
    pub messages: Vec<Message>,
    pub gold: Option<bool>,
}

pub trait TemplateStrategy: Send + Sync {
    fn format_inference_example(&self, example: &Example, shots: &[Example]) -> Result<JobPayload>;

    fn format_checker_example(
        &self,
        example: &Example,
        response: &Completion,
    ) -> Result<Vec<CheckerJob>>;

    /// Messages asking to translate `text`; `shots` are (source, target) pairs.
    fn format_translation_example(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
        shots: &[TranslationExample],
    ) -> Vec<Message>;
}

#[derive(Debug, Clone)]
pub struct FamilyTemplates {
    family: BenchmarkFamily,
    templates: PromptTemplates,
}

impl FamilyTemplates {
    pub fn new(family: BenchmarkFamily, templates: PromptTemplates) -> Self {
        Self { family, templates }
    }

    pub fn builtin(family: BenchmarkFamily) -> Self {
        Self::new(family, PromptTemplates::for_family(family))
    }

    fn wrong_family(&self, example: &Example) -> EvalError {
        EvalError::config(format!(
            "{} template cannot format a {} example",
            self.family,
            example.family()
        ))
    }

    fn question_text(&self, example: &Example) -> Result<String> {
        let t = &self.templates.inference;
        Ok(match example {
            Example::Mcqa(e) => render(
                t,
                &[
                    ("question", &e.question),
                    ("options", &render_options(&e.options)?),
                ],
            ),
            Example::OpenQa(e) => render(t, &[("question", &e.question)]),
            Example::Code(e) => render(t, &[("prompt", &e.prompt)]),
            Example::Translation(e) => render(t, &[("source", &e.source)]),
            Example::MultiTurn(_) => return Err(self.wrong_family(example)),
        })
    }

    fn shot_answer(&self, example: &Example) -> Option<String> {
        let t = &self.templates.shot_answer;
        match example {
            Example::Mcqa(e) => {
                let label = e
                    .gold_index()
                    .and_then(|i| option_label(i).ok())
                    .unwrap_or_else(|| e.answer.clone());
                Some(render(t, &[("answer", &label)]))
            }
            Example::OpenQa(e) => Some(
                render(
                    t,
                    &[
                        ("answer", &e.answer),
                        ("explanation", e.explanation.as_deref().unwrap_or("")),
                    ],
                )
                .trim()
                .to_string(),
            ),
            Example::Translation(e) => Some(render(t, &[("answer", &e.target)])),
            _ => None,
        }
    }

    fn checker_messages(&self, body: String) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2);
        if let Some(ref system) = self.templates.checker_system {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(body));
        messages
    }

    fn mcqa_checker(&self, e: &McqaExample, response: &str) -> Result<Vec<CheckerJob>> {
        let gold = e.gold_index().ok_or_else(|| {
            EvalError::Dataset(format!("answer '{}' is not a valid option label", e.answer))
        })?;
        let options = render_options(&e.options)?;

        (0..e.options.len())
            .map(|i| {
                let candidate = option_label(i)?;
                let body = render(
                    &self.templates.checker,
                    &[
                        ("question", &e.question),
                        ("options", &options),
                        ("candidate", &candidate),
                        ("response", response),
                    ],
                );
                Ok(CheckerJob {
                    messages: self.checker_messages(body),
                    gold: Some(i == gold),
                })
            })
            .collect()
    }
}

impl TemplateStrategy for FamilyTemplates {
    fn format_inference_example(&self, example: &Example, shots: &[Example]) -> Result<JobPayload> {
        if example.family() != self.family {
            return Err(self.wrong_family(example));
        }

        if let Example::MultiTurn(e) = example {
            let mut prefix = Vec::new();
            for shot in shots {
                if let Example::MultiTurn(s) = shot {
                    for (q, r) in s.questions.iter().zip(&s.references) {
                        prefix.push(Message::user(render(&self.templates.inference, &[("question", q)])));
                        prefix.push(Message::assistant(r.clone()));
                    }
                }
            }
            let questions = e
                .questions
                .iter()
                .map(|q| render(&self.templates.inference, &[("question", q)]))
                .collect();
            return Ok(JobPayload::MultiTurn { prefix, questions });
        }

        let mut messages = Vec::with_capacity(shots.len() * 2 + 1);
        for shot in shots {
            if let Some(answer) = self.shot_answer(shot) {
                messages.push(Message::user(self.question_text(shot)?));
                messages.push(Message::assistant(answer));
            }
        }
        messages.push(Message::user(self.question_text(example)?));
        Ok(JobPayload::Chat(messages))
    }

    fn format_checker_example(
        &self,
        example: &Example,
        response: &Completion,
    ) -> Result<Vec<CheckerJob>> {
        match (example, response) {
            (Example::Mcqa(e), Completion::Text(text)) => self.mcqa_checker(e, text),
            (Example::OpenQa(e), Completion::Text(text)) => {
                let body = render(
                    &self.templates.checker,
                    &[
                        ("question", &e.question),
                        ("reference", &e.answer),
                        ("explanation", e.explanation.as_deref().unwrap_or("")),
                        ("response", text),
                    ],
                );
                Ok(vec![CheckerJob {
                    messages: self.checker_messages(body),
                    gold: None,
                }])
            }
            (Example::MultiTurn(e), Completion::Conversation(turns)) => {
                let body = render(
                    &self.templates.checker,
                    &[
                        ("conversation", &render_conversation(turns)),
                        ("reference", &e.references.join("\n---\n")),
                    ],
                );
                Ok(vec![CheckerJob {
                    messages: self.checker_messages(body),
                    gold: None,
                }])
            }
            (Example::Code(_), _) | (Example::Translation(_), _) => Err(EvalError::config(format!(
                "{} examples are not judged by a checker model",
                example.family()
            ))),
            _ => Err(EvalError::Dataset(format!(
                "response shape does not match a {} example",
                example.family()
            ))),
        }
    }

    fn format_translation_example(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
        shots: &[TranslationExample],
    ) -> Vec<Message> {
        let system = render(
            &self.templates.translation_system,
            &[
                ("source_language", source_language),
                ("target_language", target_language),
            ],
        );
        let mut messages = Vec::with_capacity(shots.len() * 2 + 2);
        messages.push(Message::system(system));
        for shot in shots {
            messages.push(Message::user(shot.source.clone()));
            messages.push(Message::assistant(shot.target.clone()));
        }
        messages.push(Message::user(text.to_string()));
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::is_alternating;
    use crate::task::{MultiTurnExample, OpenQaExample};

    fn mcqa(question: &str, answer: &str) -> Example {
        Example::Mcqa(McqaExample {
            question: question.into(),
            options: vec!["red".into(), "green".into(), "blue".into()],
            answer: answer.into(),
        })
    }

    #[test]
    fn test_render_single_pass() {
        let out = render(
            "{question} / {missing}",
            &[("question", "uses {question} literally")],
        );
        assert_eq!(out, "uses {question} literally / {missing}");
    }

    #[test]
    fn test_mcqa_inference_with_shots() {
        let strategy = FamilyTemplates::builtin(BenchmarkFamily::Mcqa);
        let payload = strategy
            .format_inference_example(&mcqa("Sky?", "C"), &[mcqa("Grass?", "B")])
            .unwrap();

        let JobPayload::Chat(messages) = payload else {
            panic!("expected chat payload");
        };
        assert_eq!(messages.len(), 3);
        assert!(is_alternating(&messages));
        assert_eq!(messages[1].content, "B");
        assert!(messages[2].content.contains("C. blue"));
    }

    #[test]
    fn test_mcqa_checker_one_job_per_option() {
        let strategy = FamilyTemplates::builtin(BenchmarkFamily::Mcqa);
        let jobs = strategy
            .format_checker_example(&mcqa("Sky?", "C"), &Completion::Text("blue".into()))
            .unwrap();

        assert_eq!(jobs.len(), 3);
        let gold: Vec<_> = jobs.iter().map(|j| j.gold).collect();
        assert_eq!(gold, vec![Some(false), Some(false), Some(true)]);
        assert!(jobs[2].messages.last().unwrap().content.contains("option C"));
    }

    #[test]
    fn test_mcqa_numeric_answers_map_to_labels() {
        let strategy = FamilyTemplates::builtin(BenchmarkFamily::Mcqa);
        let jobs = strategy
            .format_checker_example(&mcqa("Sky?", "1"), &Completion::Text("A".into()))
            .unwrap();
        let gold: Vec<_> = jobs.iter().map(|j| j.gold).collect();
        assert_eq!(gold, vec![Some(true), Some(false), Some(false)]);

        let last = strategy
            .format_checker_example(&mcqa("Sky?", "3"), &Completion::Text("C".into()))
            .unwrap();
        assert_eq!(last[2].gold, Some(true));

        let payload = strategy
            .format_inference_example(&mcqa("Sky?", "3"), &[mcqa("Grass?", "2")])
            .unwrap();
        let JobPayload::Chat(messages) = payload else {
            panic!("expected chat payload");
        };
        assert_eq!(messages[1].content, "B");
    }

    #[test]
    fn test_open_qa_checker_single_job() {
        let strategy = FamilyTemplates::builtin(BenchmarkFamily::OpenQa);
        let ex = Example::OpenQa(OpenQaExample {
            question: "1+1".into(),
            answer: "2".into(),
            explanation: None,
        });
        let jobs = strategy
            .format_checker_example(&ex, &Completion::Text("It is 2".into()))
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].gold, None);
        assert!(jobs[0].messages[1].content.contains("It is 2"));
    }

    #[test]
    fn test_multi_turn_inference_and_checker() {
        let strategy = FamilyTemplates::builtin(BenchmarkFamily::MultiTurn);
        let ex = Example::MultiTurn(MultiTurnExample {
            questions: vec!["Write a haiku".into(), "Now shorter".into()],
            references: vec![],
        });

        let payload = strategy.format_inference_example(&ex, &[]).unwrap();
        match payload {
            JobPayload::MultiTurn { prefix, questions } => {
                assert!(prefix.is_empty());
                assert_eq!(questions.len(), 2);
            }
            other => panic!("unexpected payload {:?}", other),
        }

        let transcript = Completion::Conversation(vec![
            Message::user("Write a haiku"),
            Message::assistant("leaves fall"),
            Message::user("Now shorter"),
            Message::assistant("leaves"),
        ]);
        let jobs = strategy.format_checker_example(&ex, &transcript).unwrap();
        assert!(jobs[0].messages[1].content.contains("Assistant: leaves fall"));
    }

    #[test]
    fn test_translation_prompt_ends_with_text() {
        let strategy = FamilyTemplates::builtin(BenchmarkFamily::OpenQa);
        let shots = vec![TranslationExample {
            source: "hello".into(),
            target: "안녕".into(),
        }];
        let messages = strategy.format_translation_example("good night", "en", "ko", &shots);

        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("from en to ko"));
        assert_eq!(messages.last().unwrap().content, "good night");
        assert!(is_alternating(&messages));
    }

    #[test]
    fn test_code_has_no_checker() {
        let strategy = FamilyTemplates::builtin(BenchmarkFamily::Code);
        let ex = Example::Code(crate::task::CodeExample {
            task_id: "t/0".into(),
            prompt: "def f():".into(),
            test: String::new(),
            canonical_solution: String::new(),
            entry_point: "f".into(),
        });
        let err = strategy
            .format_checker_example(&ex, &Completion::Text("x".into()))
            .unwrap_err();
        assert!(matches!(err, EvalError::Configuration(_)));
    }
}
