//! Assembles the system prompt that pins the model to the loop's contract:
//! emit code in fenced blocks, signal completion with `FINAL(...)`, and
//! treat a mounted context file as a handle to query, not a blob to read
//! whole.

/// Builds the system prompt for one run. `context_mounted` switches on the
/// paragraph describing the narrow handle API — omitted entirely when no
/// context file was given, so the model isn't told about a file that
/// doesn't exist.
pub fn build_system_prompt(context_mounted: bool) -> String {
    let context_clause = if context_mounted {
        "\n\nA context file is mounted read-only inside the sandbox. Do not \
         read it in one pass. Use the handle API (search, windowed reads, \
         head/tail) to pull only the parts relevant to the task."
    } else {
        ""
    };

    format!(
        "You solve tasks by writing and running Python.\n\n\
         Rules:\n\
         1. Put the code you want executed in a single fenced code block \
            (```python ... ``` or a bare ``` ... ```).\n\
         2. You will be shown the sandboxed program's stdout and stderr after \
            each run. Use that observation to decide the next step.\n\
         3. When you have the final answer, stop writing code and emit \
            FINAL(<answer>) on its own line. Nothing after that line is read.\n\
         4. The sandbox has no network access and cannot install packages — \
            solve the task with what's already available.\n\
         5. If a run fails or produces an error, read the observation and try \
            a corrected approach; you have a limited number of iterations.\
         {context_clause}"
    )
}
