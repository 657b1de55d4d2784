//! Debug visualization of control trees.
//!
//! ```ignore
//! use trellis::logging::ControlTreeDebug;
//!
//! tracing::debug!("\n{}", ControlTreeDebug::new().format_subtree(&root));
//! ```

use std::fmt::Write as _;
use std::sync::Arc;

use crate::control::Control;

/// Style options for control tree visualization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TreeStyle {
    /// ASCII characters for tree branches.
    Ascii,
    /// Unicode box-drawing characters.
    #[default]
    Unicode,
    /// Compact single-line representation.
    Compact,
}

/// Configuration for control tree output.
#[derive(Debug, Clone)]
pub struct TreeFormatOptions {
    /// The style of tree visualization.
    pub style: TreeStyle,
    /// Whether to show the control type name.
    pub show_types: bool,
    /// Whether to show the lifecycle state.
    pub show_state: bool,
    /// Whether to show the child count.
    pub show_child_count: bool,
    /// Maximum depth to traverse (None for unlimited).
    pub max_depth: Option<usize>,
    /// Indent size for each level.
    pub indent_size: usize,
}

impl Default for TreeFormatOptions {
    fn default() -> Self {
        Self {
            style: TreeStyle::default(),
            show_types: true,
            show_state: true,
            show_child_count: false,
            max_depth: None,
            indent_size: 2,
        }
    }
}

impl TreeFormatOptions {
    /// Options for detailed output.
    pub fn detailed() -> Self {
        Self {
            show_child_count: true,
            ..Default::default()
        }
    }

    /// Options for ids only.
    pub fn minimal() -> Self {
        Self {
            show_types: false,
            show_state: false,
            show_child_count: false,
            ..Default::default()
        }
    }
}

/// Formats a control subtree for logs.
#[derive(Debug, Clone, Default)]
pub struct ControlTreeDebug {
    options: TreeFormatOptions,
}

impl ControlTreeDebug {
    /// A formatter with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// A formatter with custom options.
    pub fn with_options(options: TreeFormatOptions) -> Self {
        Self { options }
    }

    /// Format `root` and its descendants.
    pub fn format_subtree(&self, root: &Arc<Control>) -> String {
        let mut output = String::new();
        self.format_into(root, 0, true, &mut output);
        output
    }

    fn format_into(&self, control: &Arc<Control>, depth: usize, is_last: bool, output: &mut String) {
        if self.options.max_depth.is_some_and(|max| depth > max) {
            return;
        }

        output.push_str(&self.build_prefix(depth, is_last));
        match control.id() {
            Some(id) => output.push_str(&id),
            None => output.push_str("(uninitialized)"),
        }
        if self.options.show_types {
            let _ = write!(output, " ({})", control.control_name());
        }
        if self.options.show_state {
            let _ = write!(output, " [{}]", control.state());
        }
        let children = control.children();
        if self.options.show_child_count {
            let _ = write!(output, " {{{} children}}", children.len());
        }
        output.push('\n');

        let count = children.len();
        for (i, child) in children.iter().enumerate() {
            self.format_into(child, depth + 1, i + 1 == count, output);
        }
    }

    fn build_prefix(&self, depth: usize, is_last: bool) -> String {
        if depth == 0 {
            return String::new();
        }

        let (branch, corner, last) = match self.options.style {
            TreeStyle::Ascii => ("|", "+--", "`--"),
            TreeStyle::Unicode => ("\u{2502}", "\u{251c}\u{2500}\u{2500}", "\u{2514}\u{2500}\u{2500}"),
            TreeStyle::Compact => ("", "-", "-"),
        };

        let mut prefix = String::new();
        for _ in 0..(depth - 1) {
            prefix.push_str(branch);
            prefix.push_str(&" ".repeat(self.options.indent_size));
        }
        prefix.push_str(if is_last { last } else { corner });
        prefix.push(' ');
        prefix
    }
}

#[cfg(test)]
mod tests {
    use trellis_core::Runtime;

    use super::*;
    use crate::control::{ControlOptions, DefaultBehavior};
    use crate::dom::Document;

    #[test]
    fn test_format_subtree() {
        let runtime = Runtime::new();
        let document = Document::new();
        let root = Control::new(&runtime, document.clone(), ControlOptions::new("List").with_id("list"));
        root.create_child(ControlOptions::new("Item").with_id("a"), DefaultBehavior);
        let b = root.create_child(ControlOptions::new("Item").with_id("b"), DefaultBehavior);
        b.create_child(ControlOptions::new("Label").with_id("b-label"), DefaultBehavior);
        root.initialize();

        let ascii = ControlTreeDebug::with_options(TreeFormatOptions {
            style: TreeStyle::Ascii,
            ..Default::default()
        })
        .format_subtree(&root);
        assert_eq!(
            ascii,
            "list (List) [inactive]\n\
             +-- a (Item) [created]\n\
             `-- b (Item) [created]\n\
             |  `-- b-label (Label) [created]\n"
        );

        let minimal = ControlTreeDebug::with_options(TreeFormatOptions {
            max_depth: Some(1),
            ..TreeFormatOptions::minimal()
        })
        .format_subtree(&root);
        assert_eq!(minimal.lines().count(), 3);
        assert!(minimal.starts_with("list\n"));
    }
}
