//! Screening test generator
//!
//! Samples a handful of yes/no event-coreference questions from a TSV pool
//! and renders a QuestionForm plus the matching AnswerKey. Workers who pass
//! receive the screening qualification score the publisher can gate on.

use std::path::Path;

use rand::Rng;
use rand::seq::index;
use serde::Serialize;

use crate::error::{Result, WaveError};
use crate::template::{QUESTION_FORM_SCHEMA, TemplateRenderer, xml_escape};

/// AnswerKey schema
pub const ANSWER_KEY_SCHEMA: &str =
    "http://mechanicalturk.amazonaws.com/AWSMechanicalTurkDataSchemas/2005-10-01/AnswerKey.xsd";

/// Default number of sampled questions
pub const DEFAULT_QUESTION_COUNT: usize = 7;

const QUESTION_FORM: &str = r#"<QuestionForm xmlns="{{schema}}">
  <Overview>
    <Title>Screening Test</Title>
    <FormattedContent><![CDATA[<p>In this test, we ask you to identify whether two events (<b>highlighted</b> in each paragraph) indicate the same thing or not. Read each paragraph carefully and answer the question by selecting the appropriate option, <i>Yes</i> or <i>No</i>.<br /><br />In total, you are presented with {{count}} questions and the time limit for this test is 10 minutes. After submitting the test, you are automatically scored. If passed, you can accept any number of our tasks.<br /><br /><b>Note</b>: It is important you do this test on your own because our tasks are similar to the questions presented in this test.<br /><br />For your reference, we provide two examples below,<br /><br />He <b>died</b> of injuries from the accident. His friends were all saddened to hear his <b>death</b>.<br /><br /><i>Question</i>: In the above paragraph, are the highlighted events the same?<br /><i>Answer</i>: Yes (both words, <b>died</b> and <b>death</b> indicate the person's death)<br /><br />The suspect was <b>shot</b> and killed in the <b>raid</b> by the armed officers.<br /><br /><i>Question</i>: In the above paragraph, are the highlighted events the same?<br /><i>Answer</i>: No (<b>shot</b> happened during the <b>raid</b>)</p>]]></FormattedContent>
  </Overview>
{{#each questions}}
  <Question>
    <QuestionIdentifier>{{this.id}}</QuestionIdentifier>
    <IsRequired>true</IsRequired>
    <QuestionContent>
      <FormattedContent><![CDATA[<p>{{this.text}}<br /><br /><i>Question</i>: In the above paragraph, are the highlighted events the same?<br /></p>]]></FormattedContent>
    </QuestionContent>
    <AnswerSpecification>
      <SelectionAnswer>
        <StyleSuggestion>radiobutton</StyleSuggestion>
        <Selections>
          <Selection><SelectionIdentifier>Yes</SelectionIdentifier><Text>Yes</Text></Selection>
          <Selection><SelectionIdentifier>No</SelectionIdentifier><Text>No</Text></Selection>
        </Selections>
      </SelectionAnswer>
    </AnswerSpecification>
  </Question>
{{/each}}
</QuestionForm>
"#;

const ANSWER_KEY: &str = r#"<AnswerKey xmlns="{{schema}}">
{{#each answers}}
  <Question>
    <QuestionIdentifier>{{this.id}}</QuestionIdentifier>
    <AnswerOption>
      <SelectionIdentifier>{{this.answer}}</SelectionIdentifier>
      <AnswerScore>1</AnswerScore>
    </AnswerOption>
  </Question>
{{/each}}
  <QualificationValueMapping>
    <PercentageMapping>
      <MaximumSummedScore>{{count}}</MaximumSummedScore>
    </PercentageMapping>
  </QualificationValueMapping>
</AnswerKey>
"#;

/// One question from the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreeningQuestion {
    /// Line index in the source file; the header is line 0
    pub line: usize,
    pub text: String,
    pub answer: String,
    pub kind: String,
}

impl ScreeningQuestion {
    pub fn identifier(&self) -> String {
        format!("Q_{}", self.line)
    }
}

/// Parse a `question<TAB>answer<TAB>type` pool, skipping the header line
pub fn parse_questions(content: &str) -> Result<Vec<ScreeningQuestion>> {
    let mut questions = Vec::new();
    for (line, raw) in content.lines().enumerate().skip(1) {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let fields: Vec<&str> = raw.split('\t').collect();
        let [text, answer, kind] = fields.as_slice() else {
            return Err(WaveError::Config(format!(
                "screening line {}: expected 3 tab-separated fields, found {}",
                line + 1,
                fields.len()
            )));
        };
        if text.contains("]]>") {
            return Err(WaveError::Config(format!(
                "screening line {}: question text cannot contain ']]>'",
                line + 1
            )));
        }
        questions.push(ScreeningQuestion {
            line,
            text: text.to_string(),
            answer: answer.to_string(),
            kind: kind.to_string(),
        });
    }
    Ok(questions)
}

/// Read and parse a question pool file
pub fn read_questions(path: &Path) -> Result<Vec<ScreeningQuestion>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| WaveError::Config(format!("cannot read questions {}: {}", path.display(), e)))?;
    parse_questions(&content)
}

#[derive(Serialize)]
struct QuestionView {
    id: String,
    text: String,
}

#[derive(Serialize)]
struct AnswerView {
    id: String,
    answer: String,
}

#[derive(Serialize)]
struct FormContext<'a> {
    schema: &'a str,
    count: usize,
    questions: Vec<QuestionView>,
}

#[derive(Serialize)]
struct AnswerContext<'a> {
    schema: &'a str,
    count: usize,
    answers: Vec<AnswerView>,
}

/// A rendered screening test
#[derive(Debug, Clone)]
pub struct ScreeningTest {
    pub questions: Vec<ScreeningQuestion>,
    pub question_form: String,
    pub answer_key: String,
}

impl ScreeningTest {
    /// Sample `count` distinct questions from `pool` and render both documents
    pub fn generate<R: Rng + ?Sized>(pool: &[ScreeningQuestion], count: usize, rng: &mut R) -> Result<Self> {
        if count == 0 {
            return Err(WaveError::Config("screening test needs at least one question".to_string()));
        }
        if count > pool.len() {
            return Err(WaveError::Config(format!(
                "cannot sample {} questions from a pool of {}",
                count,
                pool.len()
            )));
        }

        let questions: Vec<ScreeningQuestion> = index::sample(rng, pool.len(), count)
            .into_iter()
            .map(|i| pool[i].clone())
            .collect();

        let renderer = TemplateRenderer::new();
        let question_form = renderer.render_str(
            QUESTION_FORM,
            &FormContext {
                schema: QUESTION_FORM_SCHEMA,
                count,
                questions: questions
                    .iter()
                    .map(|q| QuestionView {
                        id: q.identifier(),
                        text: q.text.clone(),
                    })
                    .collect(),
            },
        )?;
        let answer_key = renderer.render_str(
            ANSWER_KEY,
            &AnswerContext {
                schema: ANSWER_KEY_SCHEMA,
                count,
                answers: questions
                    .iter()
                    .map(|q| AnswerView {
                        id: q.identifier(),
                        answer: xml_escape(&q.answer),
                    })
                    .collect(),
            },
        )?;

        Ok(Self {
            questions,
            question_form,
            answer_key,
        })
    }

    pub fn write(&self, questions_path: &Path, answers_path: &Path) -> Result<()> {
        std::fs::write(questions_path, &self.question_form)?;
        std::fs::write(answers_path, &self.answer_key)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;

    fn pool_tsv(n: usize) -> String {
        let mut tsv = String::from("question\tanswer\ttype\n");
        for i in 0..n {
            let answer = if i % 2 == 0 { "Yes" } else { "No" };
            tsv.push_str(&format!("Paragraph <b>{}</b> text\t{}\tcoref\n", i, answer));
        }
        tsv
    }

    #[test]
    fn test_parse_skips_header_and_keeps_line_index() {
        let questions = parse_questions(&pool_tsv(3)).unwrap();
        assert_eq!(questions.len(), 3);
        assert_eq!(questions[0].line, 1);
        assert_eq!(questions[0].identifier(), "Q_1");
        assert_eq!(questions[1].answer, "No");
        assert_eq!(questions[2].kind, "coref");
    }

    #[test]
    fn test_parse_rejects_malformed_line() {
        let err = parse_questions("q\ta\tt\nonly one field\n").unwrap_err();
        assert!(matches!(err, WaveError::Config(_)));
    }

    #[test]
    fn test_parse_rejects_cdata_terminator() {
        assert!(parse_questions("q\ta\tt\nbad ]]> text\tYes\tcoref\n").is_err());
    }

    #[test]
    fn test_generate_samples_distinct_questions() {
        let pool = parse_questions(&pool_tsv(20)).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let test = ScreeningTest::generate(&pool, 7, &mut rng).unwrap();

        assert_eq!(test.questions.len(), 7);
        let ids: HashSet<String> = test.questions.iter().map(|q| q.identifier()).collect();
        assert_eq!(ids.len(), 7);

        assert_eq!(test.question_form.matches("<Question>").count(), 7);
        assert!(test.question_form.contains("presented with 7 questions"));
        assert!(test.question_form.contains(QUESTION_FORM_SCHEMA));
        assert_eq!(test.answer_key.matches("<AnswerOption>").count(), 7);
        assert!(test.answer_key.contains("<MaximumSummedScore>7</MaximumSummedScore>"));
        assert!(test.answer_key.contains(ANSWER_KEY_SCHEMA));
    }

    #[test]
    fn test_generate_answer_key_matches_questions() {
        let pool = parse_questions(&pool_tsv(5)).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let test = ScreeningTest::generate(&pool, 5, &mut rng).unwrap();
        for q in &test.questions {
            let entry = format!(
                "<QuestionIdentifier>{}</QuestionIdentifier>\n    <AnswerOption>\n      <SelectionIdentifier>{}</SelectionIdentifier>",
                q.identifier(),
                q.answer
            );
            assert!(test.answer_key.contains(&entry), "missing {}", entry);
        }
    }

    #[test]
    fn test_generate_is_reproducible_with_seed() {
        let pool = parse_questions(&pool_tsv(20)).unwrap();
        let a = ScreeningTest::generate(&pool, 7, &mut StdRng::seed_from_u64(42)).unwrap();
        let b = ScreeningTest::generate(&pool, 7, &mut StdRng::seed_from_u64(42)).unwrap();
        assert_eq!(a.questions, b.questions);
    }

    #[test]
    fn test_generate_rejects_oversized_sample() {
        let pool = parse_questions(&pool_tsv(3)).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(ScreeningTest::generate(&pool, 4, &mut rng).is_err());
        assert!(ScreeningTest::generate(&pool, 0, &mut rng).is_err());
    }

    #[test]
    fn test_write_outputs() {
        let temp = tempfile::TempDir::new().unwrap();
        let pool = parse_questions(&pool_tsv(3)).unwrap();
        let test = ScreeningTest::generate(&pool, 2, &mut StdRng::seed_from_u64(3)).unwrap();
        let q = temp.path().join("q.xml");
        let a = temp.path().join("a.xml");
        test.write(&q, &a).unwrap();
        assert_eq!(std::fs::read_to_string(&q).unwrap(), test.question_form);
        assert_eq!(std::fs::read_to_string(&a).unwrap(), test.answer_key);
    }
}
