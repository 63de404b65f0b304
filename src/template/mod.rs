//! Task layouts shown to workers.
//!
//! A task layout is parameterized only by the pair's opaque hash: the hash
//! is substituted into the annotation URL, and the URL into the layout.

mod render;

use serde::Serialize;

pub use render::{TemplateRenderer, xml_escape};

use crate::error::{Result, WaveError};

/// QuestionForm schema used by task and screening layouts
pub const QUESTION_FORM_SCHEMA: &str =
    "http://mechanicalturk.amazonaws.com/AWSMechanicalTurkDataSchemas/2017-11-06/QuestionForm.xsd";

/// Default annotation URL; `{{hash}}` is the pair hash
pub const DEFAULT_ANNOTATION_URL: &str = "https://annotate.example.org/pairs/{{hash}}";

/// Default task layout: a link to the annotation tool and a field for the
/// completion code it hands out.
pub const DEFAULT_TASK_LAYOUT: &str = r#"<QuestionForm xmlns="{{schema}}">
  <Overview>
    <Title>Cross-document event coreference</Title>
    <FormattedContent><![CDATA[<p>Open the annotation tool, link the events that refer to the same real-world happening across the two articles, then paste the completion code below.</p>]]></FormattedContent>
    <FormattedContent><![CDATA[Link to the task: <a href='{{annotation_url}}' target='_blank'>{{annotation_url}}</a>]]></FormattedContent>
  </Overview>
  <Question>
    <QuestionIdentifier>secret_code</QuestionIdentifier>
    <IsRequired>true</IsRequired>
    <QuestionContent>
      <Text>Completion code shown at the end of the annotation</Text>
    </QuestionContent>
    <AnswerSpecification>
      <FreeTextAnswer/>
    </AnswerSpecification>
  </Question>
</QuestionForm>
"#;

const LAYOUT: &str = "task_layout";
const URL: &str = "annotation_url";

#[derive(Serialize)]
struct UrlContext<'a> {
    hash: &'a str,
}

#[derive(Serialize)]
struct LayoutContext<'a> {
    schema: &'a str,
    hash: &'a str,
    annotation_url: &'a str,
}

/// Compiled task layout
pub struct TaskLayout {
    renderer: TemplateRenderer,
}

impl TaskLayout {
    /// Compile both templates and render a probe so broken templates fail
    /// before anything is published.
    pub fn new(layout: &str, annotation_url: &str) -> Result<Self> {
        if !annotation_url.contains("{{hash}}") {
            return Err(WaveError::Config(
                "annotation_url must contain {{hash}} so each task links to its pair".to_string(),
            ));
        }
        let mut renderer = TemplateRenderer::new();
        renderer.register(LAYOUT, layout)?;
        renderer.register(URL, annotation_url)?;
        let layout = Self { renderer };
        layout.render(&"0".repeat(64))?;
        Ok(layout)
    }

    pub fn render(&self, hash: &str) -> Result<String> {
        let annotation_url = self.renderer.render(URL, &UrlContext { hash })?;
        if annotation_url.contains("]]>") {
            return Err(WaveError::Template("annotation URL would terminate its CDATA section".to_string()));
        }
        self.renderer.render(
            LAYOUT,
            &LayoutContext {
                schema: QUESTION_FORM_SCHEMA,
                hash,
                annotation_url: &annotation_url,
            },
        )
    }
}

impl Default for TaskLayout {
    fn default() -> Self {
        let mut renderer = TemplateRenderer::new();
        // Built-in templates are known to compile
        let _ = renderer.register(LAYOUT, DEFAULT_TASK_LAYOUT);
        let _ = renderer.register(URL, DEFAULT_ANNOTATION_URL);
        Self { renderer }
    }
}
