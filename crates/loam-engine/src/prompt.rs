use loam_core::ToolSpec;
use loam_memory::RankedLesson;

/// Assemble the session system prompt: role, task, optional domain
/// knowledge, the lessons block (ids visible for observability), and a
/// short description of the tool surface.
pub fn build_system_prompt(
    task_text: &str,
    knowledge_snippet: Option<&str>,
    lessons: &[RankedLesson],
    tool: &ToolSpec,
) -> String {
    let mut prompt = String::from(
        "You are an agent completing a task with one tool. Work step by step: \
         issue one tool call per turn, observe the result, and stop with a \
         short summary once the task is done.",
    );

    prompt.push_str("\n\n<task>\n");
    prompt.push_str(task_text);
    prompt.push_str("\n</task>");

    if let Some(snippet) = knowledge_snippet {
        if !snippet.is_empty() {
            prompt.push_str("\n\n<domain_knowledge>\n");
            prompt.push_str(snippet);
            prompt.push_str("\n</domain_knowledge>");
        }
    }

    if !lessons.is_empty() {
        prompt.push_str("\n\n<lessons_from_prior_sessions>\n");
        prompt.push_str("Apply these rules learned from earlier runs:\n");
        for ranked in lessons {
            prompt.push_str(&format!(
                "- [{}] {}\n",
                ranked.lesson.id, ranked.lesson.rule_text
            ));
        }
        prompt.push_str("</lessons_from_prior_sessions>");
    }

    prompt.push_str(&format!(
        "\n\nTool available: {} — {}",
        tool.name, tool.description
    ));
    prompt
}

/// Hints appended to a failing tool result so the model sees them on the
/// next turn.
pub fn format_hints(lessons: &[RankedLesson]) -> String {
    if lessons.is_empty() {
        return String::new();
    }
    let mut block = String::from("\n\n[Hints from prior sessions]\n");
    for ranked in lessons {
        block.push_str(&format!(
            "- [{}] {}\n",
            ranked.lesson.id, ranked.lesson.rule_text
        ));
    }
    block
}

/// Structured validation error returned to the model for a same-step
/// retry.
pub fn format_validation_error(detail: &str, tool: &ToolSpec) -> String {
    format!(
        "[VALIDATION ERROR] Your tool call was rejected before execution: {detail}.\n\
         Required input shape for {}: {}\n\
         Re-issue the tool call with a corrected payload.",
        tool.name, tool.input_schema
    )
}

/// The no-tool reflection prompt inserted after repeated failures.
pub fn reflection_prompt() -> &'static str {
    "[REFLECTION] Pause before your next tool call. In a few sentences, \
     restate: (1) what you have tried so far, (2) why it failed, and \
     (3) what you will do differently next. Do not call the tool in this \
     reply."
}
