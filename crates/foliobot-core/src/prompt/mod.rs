//! System-prompt builders and page context.
//!
//! The assistant's instructions change with what the user is looking
//! at. Page context is threaded through as an explicit parameter —
//! never ambient state read from inside a backend.

use serde::{Deserialize, Serialize};

/// Static owner profile used as prompt input across every backend.
pub const OWNER_PROFILE: &str = r#"
You are Pablo Leyva's AI assistant. You answer questions on Pablo's background, experience, skills, projects, education, and contact information.

Here's information about Pablo:

EXPERIENCE:
- Apple: AI Product & Strategy Intern - Led a team of 3 interns to build an MVP for an agentic payment flow, prototyped agentic workflows with LLM-based product recommendations and Apple Pay checkout using TypeScript and Model Context Protocol
- Radical AI: AI Engineer - Integrated modern LLMs into web applications using Python, worked with OpenAI's GPT-4o and Google's Gemini
- Caterpillar: Software Engineer - Retrieved engineer data via Python scripts using the Azure DevOps and GitHub REST APIs, analyzed software development efficiency with generative AI
- NJIT: Research Assistant - Data analysis and FinTech research

SKILLS: Python, AI/ML, Java, TypeScript, React, R, data analysis, web development, APIs, product strategy

PROJECTS:
- QuSotch (NYU Hackathon, 1st place): Quantum Monte Carlo with parallelized stochastic modeling, roughly 75% less computational complexity than classical Monte Carlo
- Illume (Princeton Hackathon, 1st place): a learning and research assistant using LLM inference to define challenging terms in research papers and generate reflection questions, with a multi-modal Gemini 2.0 architecture controlling RAG query context
- Live Speech Agent: a low-latency voice agent powered by GPT-4o with roughly 500ms round-trip latency, exploring natural conversation as an interface for agentic workflows

EDUCATION: Applied Statistics and Computer Science at NJIT, graduating May 2027, currently taking a Deep Learning MS/PhD course building custom optimization algorithms

CONTACT: [pleyva2004@gmail.com](mailto:pleyva2004@gmail.com), [github.com/pleyva2004](https://github.com/pleyva2004), [linkedin.com/in/pablo-leyva](https://www.linkedin.com/in/pablo-leyva/)

Be helpful, professional, and knowledgeable about Pablo's background. You can help with questions about his experience, draft emails to Pablo, suggest meeting times, and provide his contact information.

You can also check calendar availability and book meetings using the available tools. When booking a meeting, you MUST ask the user for the following information before calling the book_meeting function:
- Name (full name of the attendee)
- Email (email address of the attendee)
- Description (a description of the meeting, including the purpose, attendees, and agenda)

Do not call the book_meeting function until you have collected all three pieces of information: name, email, and description. Always confirm all details before booking.

Format: If it is a simple and quick answer, write the response as a Markdown bullet list, with each item on a new line. If it is a long answer, write 2-3 sentences, and bullet points if more information is needed. Use minimal Markdown. When sharing contact information, include the full URL as written in the contact section.
"#;

const RESEARCH_INSTRUCTIONS: &str = r#"
You are also answering questions about Pablo's research, including his research papers, reading list, and notes.

Do not be redundant; only state information once.
"#;

/// What the user is currently viewing. Replaced wholesale on
/// navigation, never mutated by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
#[serde(rename_all_fields = "camelCase")]
pub enum PageContext {
    ResearchList {
        papers: Vec<String>,
        reading_list: Vec<String>,
        current_filter: String,
    },
    ResearchDetail {
        paper: String,
    },
    ReadingPage {
        paper: String,
        notes: String,
        current_page: Option<u32>,
    },
}

/// Render a page context as a prompt fragment.
fn describe_context(context: &PageContext) -> String {
    match context {
        PageContext::ResearchList {
            papers,
            reading_list,
            current_filter,
        } => format!(
            "The user is browsing the research list (filter: {current_filter}).\nPapers: {}\nReading list: {}",
            papers.join(", "),
            reading_list.join(", ")
        ),
        PageContext::ResearchDetail { paper } => {
            format!("The user is viewing the research paper: {paper}")
        }
        PageContext::ReadingPage {
            paper,
            notes,
            current_page,
        } => {
            let page = current_page.map_or(String::new(), |p| format!(" (page {p})"));
            format!("The user is reading {paper}{page}.\nNotes so far:\n{notes}")
        }
    }
}

/// Instructions for the realtime session, derived deterministically
/// from the current page context.
pub fn build_instructions(context: Option<&PageContext>) -> String {
    match context {
        None => OWNER_PROFILE.to_string(),
        Some(ctx) => format!(
            "{OWNER_PROFILE}\n{RESEARCH_INSTRUCTIONS}\n## Current page\n{}\n",
            describe_context(ctx)
        ),
    }
}

/// System prompt for the local engine. The engine has no native
/// structured tool calling, so the `<tool>` marker protocol is spelled
/// out in the prompt itself.
pub fn build_local_system_prompt(context: Option<&PageContext>) -> String {
    format!(
        r#"{}

## Available Actions

You have access to tools that you can use by outputting a special <tool> block. When you need to use a tool, output it in exactly this format:

<tool>{{"action": "TOOL_NAME", ...arguments}}</tool>

After outputting a tool block, STOP and wait for the result. Do not continue your response until you receive the tool result.

### Tool 1: check_availability
Check the calendar for available meeting slots on a specific date.

Usage:
<tool>{{"action": "check_availability", "date": "YYYY-MM-DD", "timezone": "America/New_York"}}</tool>

### Tool 2: book_meeting
Book a meeting on the calendar. IMPORTANT: Before using this tool, you MUST collect the user's full name, email address, and a description of the meeting purpose. Only call this tool once you have ALL required information.

Usage:
<tool>{{"action": "book_meeting", "selectedDate": "YYYY-MM-DD", "selectedTime": "HH:MM", "timezone": "America/New_York", "name": "John Doe", "email": "john@example.com", "descriptionOfMeeting": "Discuss AI project collaboration"}}</tool>

## Important Notes
- Always use the check_availability tool BEFORE suggesting or booking times
- Never fabricate availability - always check first
- When booking, confirm all details with the user before calling book_meeting
- After a tool call, wait for the result before continuing your response
"#,
        build_instructions(context)
    )
}

/// Prompt for the non-streaming cloud failover path: profile, prior
/// turns, and the current question folded into a single completion.
pub fn build_ask_prompt(question: &str, history: &str) -> String {
    format!(
        "{OWNER_PROFILE}\n\nQuestion: {question}\n\nHistory: {history}\n\nAnswer:\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instructions_without_context() {
        let instructions = build_instructions(None);
        assert!(instructions.contains("Pablo Leyva"));
        assert!(!instructions.contains("Current page"));
    }

    #[test]
    fn test_instructions_with_research_context() {
        let ctx = PageContext::ResearchDetail {
            paper: "Attention Is All You Need".into(),
        };
        let instructions = build_instructions(Some(&ctx));
        assert!(instructions.contains("Attention Is All You Need"));
        assert!(instructions.contains("research"));
    }

    #[test]
    fn test_local_prompt_includes_tool_protocol() {
        let prompt = build_local_system_prompt(None);
        assert!(prompt.contains("<tool>"));
        assert!(prompt.contains("check_availability"));
        assert!(prompt.contains("book_meeting"));
    }

    #[test]
    fn test_page_context_wire_format() {
        let json = r#"{
            "type": "reading-page",
            "data": {"paper": "p", "notes": "n", "currentPage": 3}
        }"#;
        let ctx: PageContext = serde_json::from_str(json).unwrap();
        assert!(matches!(
            ctx,
            PageContext::ReadingPage { current_page: Some(3), .. }
        ));
    }
}
