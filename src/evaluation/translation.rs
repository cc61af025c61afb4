//! Fragment-level translation jobs and reassembly of translated transcripts.

use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

use crate::client::{is_alternating, Message, Role};
use crate::dispatcher::{Completion, Job, JobsByCategory, StageResults, TranslationMeta};
use crate::task::{Example, TranslationExample};
use crate::template::TemplateStrategy;

pub type ExamplesByCategory = BTreeMap<String, Vec<Example>>;
pub type ConversationIds = BTreeMap<String, Vec<Uuid>>;

/// One conversation id per example, shared by both translation directions.
pub fn assign_conversations(examples: &ExamplesByCategory) -> ConversationIds {
    examples
        .iter()
        .map(|(cat, list)| (cat.clone(), list.iter().map(|_| Uuid::new_v4()).collect()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FragmentSlot {
    example: usize,
    turn: usize,
}

/// Translation jobs plus the map from job index back to (example, turn).
#[derive(Debug, Clone, Default)]
pub struct TranslationPlan {
    pub jobs: JobsByCategory,
    slots: BTreeMap<String, Vec<FragmentSlot>>,
}

impl TranslationPlan {
    pub fn job_count(&self) -> usize {
        self.jobs.values().map(Vec::len).sum()
    }

    fn push(&mut self, category: &str, slot: FragmentSlot, messages: Vec<Message>, meta: TranslationMeta) {
        let jobs = self.jobs.entry(category.to_string()).or_default();
        let index = jobs.len();
        jobs.push(Job::chat(category, index, messages).with_meta(meta));
        self.slots.entry(category.to_string()).or_default().push(slot);
    }

    /// Translated fragments per example, `turns[example]` sized by `width`.
    fn collect(
        &self,
        category: &str,
        results: &StageResults,
        widths: &[usize],
    ) -> Vec<Vec<Option<String>>> {
        let mut out: Vec<Vec<Option<String>>> = widths.iter().map(|w| vec![None; *w]).collect();
        let Some(slots) = self.slots.get(category) else {
            return out;
        };
        let translated = results.get(category);

        for (index, slot) in slots.iter().enumerate() {
            let text = translated
                .and_then(|r| r.get(index))
                .and_then(Option::as_ref)
                .and_then(Completion::as_text);
            if let (Some(text), Some(turns)) = (text, out.get_mut(slot.example)) {
                if let Some(cell) = turns.get_mut(slot.turn) {
                    *cell = Some(text.to_string());
                }
            }
        }
        out
    }
}

fn conversation_id(ids: &ConversationIds, category: &str, example: usize) -> Uuid {
    ids.get(category)
        .and_then(|v| v.get(example))
        .copied()
        .unwrap_or_else(Uuid::new_v4)
}

/// One job per source text of every example (question turns, MCQA options).
pub fn plan_question_translation(
    examples: &ExamplesByCategory,
    ids: &ConversationIds,
    strategy: &dyn TemplateStrategy,
    source_language: &str,
    target_language: &str,
    shots: &[TranslationExample],
) -> TranslationPlan {
    let mut plan = TranslationPlan::default();
    for (category, list) in examples {
        plan.jobs.entry(category.clone()).or_default();
        for (i, example) in list.iter().enumerate() {
            let conversation = conversation_id(ids, category, i);
            for (turn, text) in example.source_texts().into_iter().enumerate() {
                let messages =
                    strategy.format_translation_example(text, source_language, target_language, shots);
                plan.push(
                    category,
                    FragmentSlot { example: i, turn },
                    messages,
                    TranslationMeta {
                        turn,
                        conversation,
                        origin: Role::User,
                    },
                );
            }
        }
    }
    plan
}

/// Examples with every source text translated. An example with any
/// untranslated fragment becomes `None`.
pub fn apply_question_translations(
    examples: &ExamplesByCategory,
    plan: &TranslationPlan,
    results: &StageResults,
) -> BTreeMap<String, Vec<Option<Example>>> {
    examples
        .iter()
        .map(|(category, list)| {
            let widths: Vec<usize> = list.iter().map(|e| e.source_texts().len()).collect();
            let fragments = plan.collect(category, results, &widths);
            let translated = list
                .iter()
                .zip(fragments)
                .map(|(example, texts)| {
                    let texts: Option<Vec<String>> = texts.into_iter().collect();
                    example.with_source_texts(texts?).ok()
                })
                .collect();
            (category.clone(), translated)
        })
        .collect()
}

/// One job per assistant turn of every successful inference output.
pub fn plan_response_translation(
    inference: &StageResults,
    ids: &ConversationIds,
    strategy: &dyn TemplateStrategy,
    from_language: &str,
    to_language: &str,
    shots: &[TranslationExample],
) -> TranslationPlan {
    let mut plan = TranslationPlan::default();
    for (category, slots) in inference {
        plan.jobs.entry(category.clone()).or_default();
        for (i, slot) in slots.iter().enumerate() {
            let Some(completion) = slot else { continue };
            let conversation = conversation_id(ids, category, i);
            for (turn, reply) in completion.assistant_turns().into_iter().enumerate() {
                let messages =
                    strategy.format_translation_example(reply, from_language, to_language, shots);
                plan.push(
                    category,
                    FragmentSlot { example: i, turn },
                    messages,
                    TranslationMeta {
                        turn,
                        conversation,
                        origin: Role::Assistant,
                    },
                );
            }
        }
    }
    plan
}

/// Source-language transcripts: user turns from the original questions,
/// assistant turns from the translated responses. Anything incomplete or
/// malformed is `None` and will not be scored.
pub fn recombine(
    source: &ExamplesByCategory,
    inference: &StageResults,
    plan: &TranslationPlan,
    translated: &StageResults,
) -> StageResults {
    let mut out = StageResults::new();
    for (category, examples) in source {
        let outputs = inference.get(category);
        let widths: Vec<usize> = (0..examples.len())
            .map(|i| {
                outputs
                    .and_then(|o| o.get(i))
                    .and_then(Option::as_ref)
                    .map(|c| c.assistant_turns().len())
                    .unwrap_or(0)
            })
            .collect();
        let fragments = plan.collect(category, translated, &widths);

        let mut slots = Vec::with_capacity(examples.len());
        for (i, (example, replies)) in examples.iter().zip(fragments).enumerate() {
            let original = outputs.and_then(|o| o.get(i)).and_then(Option::as_ref);
            let rebuilt = match original {
                None => None,
                Some(completion) => rebuild(example, completion, replies),
            };
            if original.is_some() && rebuilt.is_none() {
                warn!(category = %category, index = i, "Incomplete translated transcript, item left unscored");
            }
            slots.push(rebuilt);
        }
        out.insert(category.clone(), slots);
    }
    out
}

fn rebuild(example: &Example, original: &Completion, replies: Vec<Option<String>>) -> Option<Completion> {
    let replies: Vec<String> = replies.into_iter().collect::<Option<_>>()?;
    match original {
        Completion::Text(_) => {
            let [reply]: [String; 1] = replies.try_into().ok()?;
            Some(Completion::Text(reply))
        }
        Completion::Conversation(_) => {
            let questions = example.question_turns();
            if questions.len() != replies.len() {
                return None;
            }
            let mut messages = Vec::with_capacity(replies.len() * 2);
            for (q, a) in questions.into_iter().zip(replies) {
                messages.push(Message::user(q));
                messages.push(Message::assistant(a));
            }
            is_alternating(&messages).then_some(Completion::Conversation(messages))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{BenchmarkFamily, McqaExample, MultiTurnExample};
    use crate::template::FamilyTemplates;

    /// Plays an identity translator: every job's last user message comes back.
    fn identity(plan: &TranslationPlan) -> StageResults {
        plan.jobs
            .iter()
            .map(|(cat, jobs)| {
                let slots = jobs
                    .iter()
                    .map(|job| match &job.payload {
                        crate::dispatcher::JobPayload::Chat(m) => {
                            Some(Completion::Text(m.last().unwrap().content.clone()))
                        }
                        _ => None,
                    })
                    .collect();
                (cat.clone(), slots)
            })
            .collect()
    }

    fn examples() -> ExamplesByCategory {
        let mut map = ExamplesByCategory::new();
        map.insert(
            "quiz".into(),
            vec![Example::Mcqa(McqaExample {
                question: "Capital of France?".into(),
                options: vec!["Paris".into(), "Rome".into()],
                answer: "A".into(),
            })],
        );
        map.insert(
            "chat".into(),
            vec![Example::MultiTurn(MultiTurnExample {
                questions: vec!["Hi".into(), "Bye".into()],
                references: vec![],
            })],
        );
        map
    }

    #[test]
    fn test_question_plan_covers_every_fragment() {
        let examples = examples();
        let ids = assign_conversations(&examples);
        let strategy = FamilyTemplates::builtin(BenchmarkFamily::Mcqa);
        let plan = plan_question_translation(&examples, &ids, &strategy, "en", "ko", &[]);

        assert_eq!(plan.job_count(), 5);
        let quiz = &plan.jobs["quiz"];
        assert_eq!(quiz[2].meta.unwrap().turn, 2);
        assert_eq!(quiz[0].meta.unwrap().conversation, ids["quiz"][0]);
        assert!(quiz.iter().enumerate().all(|(i, j)| j.index == i));
    }

    #[test]
    fn test_identity_round_trip_restores_examples() {
        let examples = examples();
        let ids = assign_conversations(&examples);
        let strategy = FamilyTemplates::builtin(BenchmarkFamily::Mcqa);
        let plan = plan_question_translation(&examples, &ids, &strategy, "en", "ko", &[]);

        let translated = apply_question_translations(&examples, &plan, &identity(&plan));
        for (cat, list) in &examples {
            let back: Vec<Example> = translated[cat].iter().cloned().map(Option::unwrap).collect();
            assert_eq!(&back, list);
        }
    }

    #[test]
    fn test_missing_fragment_drops_example() {
        let examples = examples();
        let ids = assign_conversations(&examples);
        let strategy = FamilyTemplates::builtin(BenchmarkFamily::Mcqa);
        let plan = plan_question_translation(&examples, &ids, &strategy, "en", "ko", &[]);
        let mut results = identity(&plan);
        results.get_mut("quiz").unwrap()[1] = None;

        let translated = apply_question_translations(&examples, &plan, &results);
        assert!(translated["quiz"][0].is_none());
        assert!(translated["chat"][0].is_some());
    }

    #[test]
    fn test_recombine_uses_original_questions() {
        let examples = examples();
        let ids = assign_conversations(&examples);
        let strategy = FamilyTemplates::builtin(BenchmarkFamily::MultiTurn);

        let mut inference = StageResults::new();
        inference.insert("quiz".into(), vec![Some(Completion::Text("A".into()))]);
        inference.insert(
            "chat".into(),
            vec![Some(Completion::Conversation(vec![
                Message::user("안녕"),
                Message::assistant("hello!"),
                Message::user("잘가"),
                Message::assistant("bye!"),
            ]))],
        );

        let plan = plan_response_translation(&inference, &ids, &strategy, "ko", "en", &[]);
        assert_eq!(plan.job_count(), 3);
        assert_eq!(plan.jobs["chat"][1].meta.unwrap().origin, Role::Assistant);

        let rebuilt = recombine(&examples, &inference, &plan, &identity(&plan));
        assert_eq!(rebuilt["quiz"][0], Some(Completion::Text("A".into())));
        match rebuilt["chat"][0].as_ref().unwrap() {
            Completion::Conversation(msgs) => {
                assert_eq!(msgs.len(), 4);
                assert_eq!(msgs[0].content, "Hi");
                assert_eq!(msgs[2].content, "Bye");
                assert_eq!(msgs[3].content, "bye!");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_recombine_marks_partial_transcripts_unscorable() {
        let examples = examples();
        let ids = assign_conversations(&examples);
        let strategy = FamilyTemplates::builtin(BenchmarkFamily::MultiTurn);

        let mut inference = StageResults::new();
        inference.insert("quiz".into(), vec![None]);
        inference.insert(
            "chat".into(),
            vec![Some(Completion::Conversation(vec![
                Message::user("안녕"),
                Message::assistant("hello!"),
                Message::user("잘가"),
                Message::assistant("bye!"),
            ]))],
        );
        let plan = plan_response_translation(&inference, &ids, &strategy, "ko", "en", &[]);
        let mut translated = identity(&plan);
        translated.get_mut("chat").unwrap()[0] = None;

        let rebuilt = recombine(&examples, &inference, &plan, &translated);
        assert!(rebuilt["quiz"][0].is_none());
        assert!(rebuilt["chat"][0].is_none());
    }
}
