//! Prompt templates for the default steps.

use pipeline_engine::{ConversationTurn, QueryRows, Role, WorkflowState};
use serde_json::{json, Value};

/// Rows shown to the model when interpreting or reviewing a result.
pub const DEFAULT_PREVIEW_ROWS: usize = 20;

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
        Role::System => "System",
    }
}

/// Render prior turns as a transcript, or an empty string when there are none.
pub fn conversation_section(turns: &[ConversationTurn]) -> String {
    if turns.is_empty() {
        return String::new();
    }
    let mut out = String::from("Conversation so far:\n");
    for turn in turns {
        out.push_str(role_label(turn.role));
        out.push_str(": ");
        out.push_str(turn.text.trim());
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Render rejection reasons of earlier attempts.
pub fn feedback_section(feedback: &[String]) -> String {
    if feedback.is_empty() {
        return String::new();
    }
    let mut out = String::from(
        "Earlier attempts were rejected. Address every point below in this attempt:\n",
    );
    for (i, reason) in feedback.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, reason));
    }
    out.push('\n');
    out
}

/// Render the first `limit` rows of a result as JSON lines.
pub fn rows_preview(rows: &QueryRows, limit: usize) -> String {
    let mut out = format!("Columns: {}\n", rows.columns.join(", "));
    for row in rows.rows.iter().take(limit) {
        out.push_str(&Value::Array(row.clone()).to_string());
        out.push('\n');
    }
    if rows.row_count() > limit {
        out.push_str(&format!("... {} more rows\n", rows.row_count() - limit));
    }
    out
}

pub fn plan_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "summary": { "type": "string" },
            "route": { "type": "string", "enum": ["query", "direct_answer"] },
            "focus": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["summary", "route"]
    })
}

pub fn verdict_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "accepted": { "type": "boolean" },
            "reason": { "type": "string" }
        },
        "required": ["accepted", "reason"]
    })
}

pub fn planning_prompt(state: &WorkflowState) -> String {
    format!(
        "You plan how to answer questions about an analytics database.\n\n\
         {context}\
         Question: {question}\n\n\
         Summarize what the user wants in one sentence. Choose route \"query\" if \
         answering needs data from the database, or \"direct_answer\" if it can be \
         answered from the conversation or general knowledge. List the metrics, \
         entities or tables the question refers to as focus.",
        context = conversation_section(&state.conversation_context),
        question = state.original_question.trim(),
    )
}

pub fn query_prompt(state: &WorkflowState, feedback: &[String]) -> String {
    let (summary, focus) = match &state.plan {
        Some(plan) => (plan.summary.as_str(), plan.focus.join(", ")),
        None => ("", String::new()),
    };
    format!(
        "Write one read-only SQL query that answers the question.\n\n\
         {context}\
         Question: {question}\n\
         Intent: {summary}\n\
         Focus: {focus}\n\n\
         {feedback}\
         Return only the SQL, without explanation.",
        context = conversation_section(&state.conversation_context),
        question = state.original_question.trim(),
        summary = summary,
        focus = focus,
        feedback = feedback_section(feedback),
    )
}

pub fn query_review_prompt(state: &WorkflowState, query: &str) -> String {
    format!(
        "Review a SQL query written to answer a question.\n\n\
         Question: {question}\n\n\
         Query:\n{query}\n\n\
         Accept it only if it is read-only and actually answers the question. \
         Give a short reason either way.",
        question = state.original_question.trim(),
        query = query,
    )
}

pub fn interpretation_prompt(
    state: &WorkflowState,
    rows: &QueryRows,
    preview_rows: usize,
    feedback: &[String],
) -> String {
    format!(
        "Answer the question using the query result below.\n\n\
         Question: {question}\n\
         Query: {query}\n\
         Total rows: {count}\n\
         {preview}\n\
         {feedback}\
         State the answer plainly. Do not claim anything the rows do not show.",
        question = state.original_question.trim(),
        query = state.candidate_query.as_deref().unwrap_or_default(),
        count = rows.row_count(),
        preview = rows_preview(rows, preview_rows),
        feedback = feedback_section(feedback),
    )
}

pub fn interpretation_review_prompt(
    state: &WorkflowState,
    rows: &QueryRows,
    interpretation: &str,
    preview_rows: usize,
) -> String {
    format!(
        "Check whether an answer is supported by a query result.\n\n\
         Question: {question}\n\
         Total rows: {count}\n\
         {preview}\n\
         Answer: {interpretation}\n\n\
         Accept it only if every claim follows from the rows and it answers the \
         question. Give a short reason either way.",
        question = state.original_question.trim(),
        count = rows.row_count(),
        preview = rows_preview(rows, preview_rows),
        interpretation = interpretation,
    )
}

pub fn direct_answer_prompt(state: &WorkflowState) -> String {
    format!(
        "You are a helpful analytics assistant.\n\n\
         {context}\
         Question: {question}\n\n\
         Answer without querying any data. Be concise.",
        context = conversation_section(&state.conversation_context),
        question = state.original_question.trim(),
    )
}

/// Remove a surrounding markdown code fence, if any.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (```sql) up to the first newline.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}
