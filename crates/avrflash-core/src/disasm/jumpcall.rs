//! Jump and call targets collected during the first disassembly pass

use super::LabelSource;

/// A control transfer from one address to another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// Address of the jump or call instruction
    pub from: u32,
    /// Target address
    pub to: u32,
    /// Mnemonic of the instruction
    pub mnemonic: &'static str,
    /// True if the target is reached by a call
    pub is_call: bool,
    /// Number within its class, 0 until enumerated
    pub label: u32,
}

/// Edge list with function/label numbering
#[derive(Debug, Clone, Default)]
pub struct JumpCalls {
    edges: Vec<Edge>,
}

impl JumpCalls {
    /// Create an empty edge list
    pub fn new() -> Self {
        Self::default()
    }

    /// All edges, sorted by target once enumerated
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Drop all edges
    pub fn clear(&mut self) {
        self.edges.clear();
    }

    /// Record an edge unless an identical one is already present
    pub fn register_edge(&mut self, from: u32, to: u32, mnemonic: &'static str, is_call: bool) {
        if self
            .edges
            .iter()
            .any(|e| e.from == from && e.to == to && e.mnemonic == mnemonic)
        {
            return;
        }
        self.edges.push(Edge {
            from,
            to,
            mnemonic,
            is_call,
            label: 0,
        });
    }

    /// Classify and number the targets
    ///
    /// Edges are sorted by target. A target called from anywhere is a
    /// function; functions and labels are numbered separately from 1 in
    /// ascending target order.
    pub fn enumerate(&mut self) {
        if self.edges.is_empty() {
            return;
        }
        self.edges.sort_by_key(|e| e.to);

        let mut start = 0;
        while start < self.edges.len() {
            let to = self.edges[start].to;
            let end = start + self.edges[start..].iter().take_while(|e| e.to == to).count();
            let is_call = self.edges[start..end].iter().any(|e| e.is_call);
            for e in &mut self.edges[start..end] {
                e.is_call = is_call;
            }
            start = end;
        }

        let (mut functions, mut labels) = (0, 0);
        let mut prev: Option<u32> = None;
        for e in &mut self.edges {
            if prev != Some(e.to) {
                if e.is_call {
                    functions += 1;
                } else {
                    labels += 1;
                }
                prev = Some(e.to);
            }
            e.label = if e.is_call { functions } else { labels };
        }
    }

    /// Symbolic name for `addr`: a tag file label, `Function<N>`, `Label<N>` or `UNKNOWN`
    pub fn label_name(&self, addr: u32, tags: &dyn LabelSource) -> String {
        if let Some(name) = tags.label(addr) {
            return name.to_string();
        }
        match self.edges.iter().find(|e| e.to == addr) {
            Some(e) if e.is_call => format!("Function{}", e.label),
            Some(e) => format!("Label{}", e.label),
            None => "UNKNOWN".to_string(),
        }
    }

    /// Back-reference lines and the label line for `position`, if anything jumps there
    pub fn references(&self, position: u32, tags: &dyn LabelSource) -> Vec<String> {
        let mut out: Vec<String> = self
            .edges
            .iter()
            .filter(|e| e.to == position)
            .map(|e| format!("; Referenced from 0x{:02x} by {}", e.from, e.mnemonic))
            .collect();
        if !out.is_empty() {
            let name = self.label_name(position, tags);
            match tags.comment(position) {
                Some(c) => out.push(format!("{}:     ; {}", name, c)),
                None => out.push(format!("{}:", name)),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_tags() -> HashMap<u32, String> {
        HashMap::new()
    }

    #[test]
    fn test_call_makes_function() {
        let mut jc = JumpCalls::new();
        jc.register_edge(10, 20, "rjmp", false);
        jc.register_edge(14, 20, "rcall", true);
        jc.register_edge(18, 30, "rjmp", false);
        jc.enumerate();
        assert_eq!(jc.label_name(20, &no_tags()), "Function1");
        assert_eq!(jc.label_name(30, &no_tags()), "Label1");
        assert_eq!(jc.label_name(40, &no_tags()), "UNKNOWN");
    }

    #[test]
    fn test_duplicate_edges_ignored() {
        let mut jc = JumpCalls::new();
        jc.register_edge(2, 8, "rjmp", false);
        jc.register_edge(2, 8, "rjmp", false);
        jc.register_edge(4, 8, "rjmp", false);
        assert_eq!(jc.edges().len(), 2);
    }

    #[test]
    fn test_numbering_is_contiguous_per_class() {
        let mut jc = JumpCalls::new();
        jc.register_edge(0, 0x40, "call", true);
        jc.register_edge(0, 0x10, "rjmp", false);
        jc.register_edge(0, 0x30, "rcall", true);
        jc.register_edge(0, 0x20, "breq", false);
        jc.enumerate();
        let t = no_tags();
        assert_eq!(jc.label_name(0x10, &t), "Label1");
        assert_eq!(jc.label_name(0x20, &t), "Label2");
        assert_eq!(jc.label_name(0x30, &t), "Function1");
        assert_eq!(jc.label_name(0x40, &t), "Function2");
    }

    #[test]
    fn test_single_edge_is_numbered() {
        let mut jc = JumpCalls::new();
        jc.register_edge(0, 6, "rjmp", false);
        jc.enumerate();
        assert_eq!(jc.label_name(6, &no_tags()), "Label1");
    }

    #[test]
    fn test_references_and_tag_labels() {
        let mut jc = JumpCalls::new();
        jc.register_edge(0x10, 0x20, "rcall", true);
        jc.enumerate();
        let mut tags = HashMap::new();
        tags.insert(0x20u32, "main".to_string());
        assert_eq!(
            jc.references(0x20, &tags),
            vec!["; Referenced from 0x10 by rcall".to_string(), "main:".to_string()]
        );
        assert!(jc.references(0x22, &tags).is_empty());
    }
}
