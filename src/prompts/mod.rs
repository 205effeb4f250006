//! Prompt templates for the model-backed stages.
//!
//! Templates are rendered with tera. Every template asks for a JSON reply
//! so responses can go through [`crate::utils::json_extraction`].

use serde::Serialize;
use tera::{Context, Tera};

use crate::llm::Message;

/// A rendered system/user prompt pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn into_messages(self) -> Vec<Message> {
        vec![Message::system(self.system), Message::user(self.user)]
    }
}

/// Question-level fields shared by every template.
#[derive(Debug, Clone, Serialize)]
pub struct QuestionContext<'a> {
    pub question: &'a str,
    pub hint: &'a str,
}

pub const KEYWORD_EXTRACTION_SYSTEM: &str =
    "You analyze natural language questions about relational databases. Reply with JSON only.";

pub const KEYWORD_EXTRACTION_TEMPLATE: &str = r#"Extract the keywords, keyphrases and named entities from the question and hint below.
Keep literal values (names, numbers, dates, codes) exactly as written. Include column-like phrases
that describe what must be filtered, grouped or returned.

Question: {{ question }}
Hint: {{ hint }}

Respond with a JSON array of strings, for example ["keyword one", "keyword two"]."#;

pub const COLUMN_FILTERING_SYSTEM: &str =
    "You are a database expert deciding which columns could matter for a question. Reply with JSON only.";

pub const COLUMN_FILTERING_TEMPLATE: &str = r#"Table:
{{ table_schema }}

Question: {{ question }}
Hint: {{ hint }}

List every column of this table that could be needed to answer the question, including columns
needed to join with other tables. If none are relevant, return an empty list.

Respond with JSON: {"relevant_columns": ["column", ...]}"#;

pub const TABLE_SELECTION_SYSTEM: &str =
    "You are a database expert selecting the tables a SQL query needs. Reply with JSON only.";

pub const TABLE_SELECTION_TEMPLATE: &str = r#"Database schema:
{{ schema }}

Question: {{ question }}
Hint: {{ hint }}

Think step by step about which tables are required to answer the question, including tables
needed only for joins. Use the exact table names from the schema.

Respond with JSON: {"chain_of_thought_reasoning": "...", "table_names": ["table", ...]}"#;

pub const COLUMN_SELECTION_SYSTEM: &str =
    "You are a database expert selecting the columns a SQL query needs. Reply with JSON only.";

pub const COLUMN_SELECTION_TEMPLATE: &str = r#"Database schema:
{{ schema }}

Question: {{ question }}
Hint: {{ hint }}

Select the minimal set of columns needed to write the SQL query: columns used in SELECT, WHERE,
GROUP BY, ORDER BY and JOIN conditions. Use the exact names from the schema.

Respond with JSON: {"chain_of_thought_reasoning": "...", "columns": {"table": ["column", ...]}}"#;

pub const CANDIDATE_GENERATION_SYSTEM: &str =
    "You are an expert SQLite developer translating questions into SQL. Reply with JSON only.";

pub const CANDIDATE_GENERATION_TEMPLATE: &str = r#"Database schema:
{{ schema }}
{% if similar_values %}
Values found in the database that match the question:
{% for value in similar_values %}- {{ value }}
{% endfor %}{% endif %}
Question: {{ question }}
Hint: {{ hint }}

Write one SQLite query that answers the question. Only return the columns the question asks for.
Use backticks around identifiers that contain spaces or special characters.

Respond with JSON: {"chain_of_thought_reasoning": "...", "SQL": "SELECT ..."}"#;

fn render(template: &str, context: &Context) -> Result<String, tera::Error> {
    Tera::one_off(template, context, false)
}

fn question_context(question: &QuestionContext<'_>) -> Context {
    let mut context = Context::new();
    context.insert("question", question.question);
    context.insert("hint", question.hint);
    context
}

pub fn build_keyword_extraction_prompt(question: &QuestionContext<'_>) -> Result<Prompt, tera::Error> {
    Ok(Prompt {
        system: KEYWORD_EXTRACTION_SYSTEM.to_string(),
        user: render(KEYWORD_EXTRACTION_TEMPLATE, &question_context(question))?,
    })
}

pub fn build_column_filtering_prompt(
    question: &QuestionContext<'_>,
    table_schema: &str,
) -> Result<Prompt, tera::Error> {
    let mut context = question_context(question);
    context.insert("table_schema", table_schema);
    Ok(Prompt {
        system: COLUMN_FILTERING_SYSTEM.to_string(),
        user: render(COLUMN_FILTERING_TEMPLATE, &context)?,
    })
}

pub fn build_table_selection_prompt(
    question: &QuestionContext<'_>,
    schema: &str,
) -> Result<Prompt, tera::Error> {
    let mut context = question_context(question);
    context.insert("schema", schema);
    Ok(Prompt {
        system: TABLE_SELECTION_SYSTEM.to_string(),
        user: render(TABLE_SELECTION_TEMPLATE, &context)?,
    })
}

pub fn build_column_selection_prompt(
    question: &QuestionContext<'_>,
    schema: &str,
) -> Result<Prompt, tera::Error> {
    let mut context = question_context(question);
    context.insert("schema", schema);
    Ok(Prompt {
        system: COLUMN_SELECTION_SYSTEM.to_string(),
        user: render(COLUMN_SELECTION_TEMPLATE, &context)?,
    })
}

pub fn build_candidate_generation_prompt(
    question: &QuestionContext<'_>,
    schema: &str,
    similar_values: &[String],
) -> Result<Prompt, tera::Error> {
    let mut context = question_context(question);
    context.insert("schema", schema);
    context.insert("similar_values", similar_values);
    Ok(Prompt {
        system: CANDIDATE_GENERATION_SYSTEM.to_string(),
        user: render(CANDIDATE_GENERATION_TEMPLATE, &context)?,
    })
}
