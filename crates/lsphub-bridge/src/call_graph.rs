use std::collections::HashSet;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use futures_util::future::BoxFuture;
use lsphub_core::Error;
use lsphub_lsp::{
    CallHierarchyIncomingCall, CallHierarchyItem, CallHierarchyOutgoingCall, symbol_kind_name,
};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

pub const DEFAULT_DEPTH_UP: usize = 5;
pub const DEFAULT_DEPTH_DOWN: usize = 5;
pub const DEFAULT_MAX_NODES: usize = 100;
pub const HARD_LIMIT_NODES: usize = 500;
const TIMEOUT_SECONDS: u64 = 60;
// Concurrent LSP calls per expansion level.
const EXPANSION_WIDTH: usize = 5;

/// The LSP seam of the engine. The bridge implements it against live
/// clients; tests drive it with a scripted graph.
pub trait CallHierarchyProvider: Send + Sync {
    fn prepare(
        &self,
        uri: String,
        line: u32,
        character: u32,
    ) -> BoxFuture<'_, Result<Vec<CallHierarchyItem>, Error>>;
    fn incoming(
        &self,
        item: CallHierarchyItem,
    ) -> BoxFuture<'_, Result<Vec<CallHierarchyIncomingCall>, Error>>;
    fn outgoing(
        &self,
        item: CallHierarchyItem,
    ) -> BoxFuture<'_, Result<Vec<CallHierarchyOutgoingCall>, Error>>;
}

/// Traversal bounds. Zero means "unlimited", clamped by the hard cap.
#[derive(Debug, Clone, Copy)]
pub struct CallGraphOptions {
    pub depth_up: usize,
    pub depth_down: usize,
    pub max_nodes: usize,
}

impl Default for CallGraphOptions {
    fn default() -> Self {
        Self {
            depth_up: DEFAULT_DEPTH_UP,
            depth_down: DEFAULT_DEPTH_DOWN,
            max_nodes: DEFAULT_MAX_NODES,
        }
    }
}

impl CallGraphOptions {
    fn normalized(self) -> Self {
        let clamp = |v: usize| if v == 0 { HARD_LIMIT_NODES } else { v };
        Self {
            depth_up: clamp(self.depth_up),
            depth_down: clamp(self.depth_down),
            max_nodes: if self.max_nodes == 0 || self.max_nodes > HARD_LIMIT_NODES {
                HARD_LIMIT_NODES
            } else {
                self.max_nodes
            },
        }
    }
}

/// Symbol names that mark externally-triggered code (event handlers,
/// command dispatchers). Matched exactly or as a substring, so decorated
/// forms like `Форма_ПриОткрытии` are caught too.
#[derive(Debug, Clone)]
pub struct EntryPoints {
    names: HashSet<String>,
}

impl EntryPoints {
    /// The 1C/BSL event-handler vocabulary, Russian and English.
    pub fn bsl_defaults() -> Self {
        let names = [
            // Document events
            "ПриЗаписи",
            "ПриПроведении",
            "ПриОтменеПроведения",
            "ПередЗаписью",
            "ПередУдалением",
            "ПриУстановкеНовогоНомера",
            "ПриКопировании",
            "ОбработкаЗаполнения",
            "ОбработкаПроверкиЗаполнения",
            // Form events
            "ПриСозданииНаСервере",
            "ПриОткрытии",
            "ПриЗакрытии",
            "ПередЗаписьюНаСервере",
            "ПриЗаписиНаСервере",
            "ПослеЗаписиНаСервере",
            "ПриЧтенииНаСервере",
            "ОбработкаОповещения",
            "ОбработкаНавигационнойСсылки",
            // Commands
            "ОбработкаКоманды",
            "ПриВыполнении",
            // Session events
            "ПриНачалеРаботыСистемы",
            "ПриЗавершенииРаботыСистемы",
            "ПередНачаломРаботыСистемы",
            "ПередЗавершениемРаботыСистемы",
            // Scheduled jobs
            "ОбработчикРегламентногоЗадания",
            // HTTP and web services
            "ОбработкаВызоваHTTPСервиса",
            "ОбработкаВызоваWebСервиса",
            // English equivalents
            "OnWrite",
            "Posting",
            "OnOpen",
            "OnCreateAtServer",
            "BeforeWrite",
            "OnClose",
        ];
        Self {
            names: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_extra<I: IntoIterator<Item = String>>(mut self, extra: I) -> Self {
        self.names.extend(extra);
        self
    }

    pub fn matches(&self, name: &str) -> bool {
        if self.names.contains(name) {
            return true;
        }
        self.names.iter().any(|ep| name.contains(ep.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CallGraphNode {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uri: String,
    pub line: u32,
    pub character: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_entry_point: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_cycle: bool,
    pub depth: usize,
    /// "up", "down" or "root"
    pub direction: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<CallGraphNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallGraphResult {
    pub root: CallGraphNode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incoming_tree: Option<CallGraphNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outgoing_tree: Option<CallGraphNode>,
    pub total_nodes: usize,
    pub max_depth_up_reached: usize,
    pub max_depth_down_reached: usize,
    pub truncated: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub truncate_reason: String,
    pub cycles_found: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entry_points_found: Vec<String>,
    pub elapsed_ms: u64,
}

struct Builder {
    provider: Arc<dyn CallHierarchyProvider>,
    entry_points: EntryPoints,
    options: CallGraphOptions,
    deadline: Instant,
    visited: StdMutex<HashSet<String>>,
    node_count: AtomicUsize,
    cycles_found: AtomicUsize,
    entry_points_found: StdMutex<Vec<String>>,
    max_depth_up: AtomicUsize,
    max_depth_down: AtomicUsize,
    truncated: StdMutex<Option<String>>,
}

fn node_key(item: &CallHierarchyItem) -> String {
    format!(
        "{}:{}:{}",
        item.uri, item.range.start.line, item.range.start.character
    )
}

/// Builds the complete call graph around the symbol at the given position:
/// the incoming (callers) and outgoing (callees) trees are expanded
/// concurrently, bounded by depth, node count and a 60 s deadline, with
/// cycle edges emitted as marked leaves instead of real back edges.
///
/// Returns `Ok(None)` when `prepareCallHierarchy` finds no item at the
/// position.
pub async fn build_call_graph(
    provider: Arc<dyn CallHierarchyProvider>,
    uri: &str,
    line: u32,
    character: u32,
    options: CallGraphOptions,
    entry_points: EntryPoints,
) -> Result<Option<CallGraphResult>, Error> {
    let started = Instant::now();
    let options = options.normalized();

    let items = provider.prepare(uri.to_string(), line, character).await?;
    let Some(root_item) = items.into_iter().next() else {
        return Ok(None);
    };

    let builder = Arc::new(Builder {
        provider,
        entry_points,
        options,
        deadline: started + std::time::Duration::from_secs(TIMEOUT_SECONDS),
        visited: StdMutex::new(HashSet::new()),
        node_count: AtomicUsize::new(0),
        cycles_found: AtomicUsize::new(0),
        entry_points_found: StdMutex::new(Vec::new()),
        max_depth_up: AtomicUsize::new(0),
        max_depth_down: AtomicUsize::new(0),
        truncated: StdMutex::new(None),
    });

    let mut root = builder.item_to_node(&root_item, 0, "root");
    if builder.entry_points.matches(&root_item.name) {
        root.is_entry_point = true;
        builder.record_entry_point(&root_item.name);
    }
    // Seed the visited set so an edge back to the root becomes a cycle leaf.
    builder
        .visited
        .lock()
        .expect("visited lock poisoned")
        .insert(node_key(&root_item));

    let (incoming_tree, outgoing_tree) = tokio::join!(
        build_tree(builder.clone(), root_item.clone(), 1, Direction::Up),
        build_tree(builder.clone(), root_item, 1, Direction::Down),
    );

    let truncate_reason = builder
        .truncated
        .lock()
        .expect("truncated lock poisoned")
        .clone();

    Ok(Some(CallGraphResult {
        root,
        incoming_tree,
        outgoing_tree,
        total_nodes: builder.node_count.load(Ordering::Relaxed),
        max_depth_up_reached: builder.max_depth_up.load(Ordering::Relaxed),
        max_depth_down_reached: builder.max_depth_down.load(Ordering::Relaxed),
        truncated: truncate_reason.is_some(),
        truncate_reason: truncate_reason.unwrap_or_default(),
        cycles_found: builder.cycles_found.load(Ordering::Relaxed),
        entry_points_found: builder
            .entry_points_found
            .lock()
            .expect("entry points lock poisoned")
            .clone(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    }))
}

impl Builder {
    fn item_to_node(&self, item: &CallHierarchyItem, depth: usize, direction: &str) -> CallGraphNode {
        self.node_count.fetch_add(1, Ordering::Relaxed);
        CallGraphNode {
            id: node_key(item),
            name: item.name.clone(),
            kind: symbol_kind_name(item.kind).to_string(),
            uri: item.uri.clone(),
            line: item.range.start.line,
            character: item.range.start.character,
            is_entry_point: false,
            is_cycle: false,
            depth,
            direction: direction.to_string(),
            children: Vec::new(),
        }
    }

    fn record_entry_point(&self, name: &str) {
        let mut found = self
            .entry_points_found
            .lock()
            .expect("entry points lock poisoned");
        if !found.iter().any(|n| n == name) {
            found.push(name.to_string());
        }
    }

    fn set_truncated(&self, reason: &str) {
        let mut truncated = self.truncated.lock().expect("truncated lock poisoned");
        if truncated.is_none() {
            *truncated = Some(reason.to_string());
        }
    }

    fn node_limit_reached(&self) -> bool {
        self.node_count.load(Ordering::Relaxed) >= self.options.max_nodes
    }

    fn depth_limit(&self, direction: Direction) -> usize {
        match direction {
            Direction::Up => self.options.depth_up,
            Direction::Down => self.options.depth_down,
        }
    }

    fn note_depth(&self, direction: Direction, depth: usize) {
        let counter = match direction {
            Direction::Up => &self.max_depth_up,
            Direction::Down => &self.max_depth_down,
        };
        counter.fetch_max(depth, Ordering::Relaxed);
    }
}

/// Expands one level of the tree. Cancellation (the engine deadline) is
/// observed at every iteration and before each child task.
fn build_tree(
    builder: Arc<Builder>,
    item: CallHierarchyItem,
    depth: usize,
    direction: Direction,
) -> BoxFuture<'static, Option<CallGraphNode>> {
    Box::pin(async move {
        if Instant::now() >= builder.deadline {
            builder.set_truncated(&format!("timeout after {TIMEOUT_SECONDS} seconds"));
            return None;
        }
        if depth > builder.depth_limit(direction) {
            return None;
        }
        if builder.node_limit_reached() {
            builder.set_truncated(&format!(
                "max_nodes limit reached ({})",
                builder.options.max_nodes
            ));
            return None;
        }

        builder.note_depth(direction, depth);

        let edges: Vec<CallHierarchyItem> = match direction {
            Direction::Up => match builder.provider.incoming(item.clone()).await {
                Ok(calls) => calls.into_iter().map(|c| c.from).collect(),
                Err(err) => {
                    warn!("call graph: failed to get incoming calls: {err}");
                    return None;
                }
            },
            Direction::Down => match builder.provider.outgoing(item.clone()).await {
                Ok(calls) => calls.into_iter().map(|c| c.to).collect(),
                Err(err) => {
                    warn!("call graph: failed to get outgoing calls: {err}");
                    return None;
                }
            },
        };
        if edges.is_empty() {
            return None;
        }

        let container_name = match direction {
            Direction::Up => format!("Callers of {}", item.name),
            Direction::Down => format!("Calls from {}", item.name),
        };
        let mut container = CallGraphNode {
            id: format!(
                "{}-{}:{}",
                match direction {
                    Direction::Up => "incoming",
                    Direction::Down => "outgoing",
                },
                item.uri,
                item.range.start.line
            ),
            name: container_name,
            kind: String::new(),
            uri: String::new(),
            line: 0,
            character: 0,
            is_entry_point: false,
            is_cycle: false,
            depth,
            direction: direction.as_str().to_string(),
            children: Vec::new(),
        };

        let semaphore = Arc::new(Semaphore::new(EXPANSION_WIDTH));
        let mut tasks: JoinSet<Option<CallGraphNode>> = JoinSet::new();

        for neighbor in edges {
            if builder.node_limit_reached() {
                builder.set_truncated(&format!(
                    "max_nodes limit reached ({})",
                    builder.options.max_nodes
                ));
                break;
            }
            if Instant::now() >= builder.deadline {
                builder.set_truncated(&format!("timeout after {TIMEOUT_SECONDS} seconds"));
                break;
            }

            let builder = builder.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await.ok()?;

                // Re-check under the permit: the loop's check raced with
                // sibling tasks, so overshoot stays within the expansion
                // width.
                if builder.node_limit_reached() {
                    builder.set_truncated(&format!(
                        "max_nodes limit reached ({})",
                        builder.options.max_nodes
                    ));
                    return None;
                }

                let key = node_key(&neighbor);
                let is_cycle = builder
                    .visited
                    .lock()
                    .expect("visited lock poisoned")
                    .contains(&key);

                let mut node = builder.item_to_node(&neighbor, depth, direction.as_str());

                if is_cycle {
                    // A revisit becomes a marked leaf; no back edges.
                    node.is_cycle = true;
                    builder.cycles_found.fetch_add(1, Ordering::Relaxed);
                    return Some(node);
                }
                builder
                    .visited
                    .lock()
                    .expect("visited lock poisoned")
                    .insert(key);

                if direction == Direction::Up && builder.entry_points.matches(&neighbor.name) {
                    node.is_entry_point = true;
                    builder.record_entry_point(&neighbor.name);
                }

                if let Some(subtree) =
                    build_tree(builder.clone(), neighbor, depth + 1, direction).await
                    && !subtree.children.is_empty()
                {
                    node.children = subtree.children;
                }
                Some(node)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(node)) => container.children.push(node),
                Ok(None) => {}
                Err(err) => warn!("call graph: expansion task failed: {err}"),
            }
        }

        if container.children.is_empty() {
            return None;
        }
        Some(container)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsphub_lsp::{Position, Range};
    use std::collections::HashMap;

    fn item(name: &str, line: u32) -> CallHierarchyItem {
        CallHierarchyItem {
            name: name.to_string(),
            kind: 12,
            uri: format!("file:///projects/{name}.bsl"),
            range: Range {
                start: Position { line, character: 0 },
                end: Position {
                    line: line + 10,
                    character: 0,
                },
            },
            selection_range: Range {
                start: Position { line, character: 10 },
                end: Position {
                    line,
                    character: 20,
                },
            },
            detail: None,
            data: None,
        }
    }

    /// Scripted call graph keyed by symbol name.
    struct FakeGraph {
        root: CallHierarchyItem,
        callers: HashMap<String, Vec<CallHierarchyItem>>,
        callees: HashMap<String, Vec<CallHierarchyItem>>,
    }

    impl CallHierarchyProvider for FakeGraph {
        fn prepare(
            &self,
            _uri: String,
            _line: u32,
            _character: u32,
        ) -> BoxFuture<'_, Result<Vec<CallHierarchyItem>, Error>> {
            let root = self.root.clone();
            Box::pin(async move { Ok(vec![root]) })
        }

        fn incoming(
            &self,
            item: CallHierarchyItem,
        ) -> BoxFuture<'_, Result<Vec<CallHierarchyIncomingCall>, Error>> {
            let calls = self
                .callers
                .get(&item.name)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|from| CallHierarchyIncomingCall {
                    from,
                    from_ranges: Vec::new(),
                })
                .collect();
            Box::pin(async move { Ok(calls) })
        }

        fn outgoing(
            &self,
            item: CallHierarchyItem,
        ) -> BoxFuture<'_, Result<Vec<CallHierarchyOutgoingCall>, Error>> {
            let calls = self
                .callees
                .get(&item.name)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|to| CallHierarchyOutgoingCall {
                    to,
                    from_ranges: Vec::new(),
                })
                .collect();
            Box::pin(async move { Ok(calls) })
        }
    }

    struct EmptyProvider;

    impl CallHierarchyProvider for EmptyProvider {
        fn prepare(
            &self,
            _uri: String,
            _line: u32,
            _character: u32,
        ) -> BoxFuture<'_, Result<Vec<CallHierarchyItem>, Error>> {
            Box::pin(async { Ok(Vec::new()) })
        }
        fn incoming(
            &self,
            _item: CallHierarchyItem,
        ) -> BoxFuture<'_, Result<Vec<CallHierarchyIncomingCall>, Error>> {
            Box::pin(async { Ok(Vec::new()) })
        }
        fn outgoing(
            &self,
            _item: CallHierarchyItem,
        ) -> BoxFuture<'_, Result<Vec<CallHierarchyOutgoingCall>, Error>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    #[tokio::test]
    async fn no_item_at_position_returns_none() {
        let result = build_call_graph(
            Arc::new(EmptyProvider),
            "file:///projects/a.bsl",
            0,
            0,
            CallGraphOptions::default(),
            EntryPoints::bsl_defaults(),
        )
        .await
        .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn cycle_is_emitted_as_marked_leaf() {
        // A -> B -> A, traversing down.
        let a = item("A", 1);
        let b = item("B", 20);
        let provider = FakeGraph {
            root: a.clone(),
            callers: HashMap::new(),
            callees: HashMap::from([
                ("A".to_string(), vec![b.clone()]),
                ("B".to_string(), vec![a.clone()]),
            ]),
        };

        let result = build_call_graph(
            Arc::new(provider),
            &a.uri,
            1,
            0,
            CallGraphOptions {
                depth_up: 0,
                depth_down: 10,
                max_nodes: 100,
            },
            EntryPoints::bsl_defaults(),
        )
        .await
        .unwrap()
        .expect("graph");

        assert_eq!(result.root.name, "A");
        assert!(!result.truncated);
        assert!(result.cycles_found >= 1);

        let outgoing = result.outgoing_tree.expect("outgoing tree");
        assert_eq!(outgoing.children.len(), 1);
        let b_node = &outgoing.children[0];
        assert_eq!(b_node.name, "B");
        assert!(!b_node.is_cycle);

        // B's child is A again, marked as a cycle leaf with no recursion.
        let a_again = b_node
            .children
            .iter()
            .find(|c| c.name == "A")
            .expect("cycle leaf");
        assert!(a_again.is_cycle);
        assert!(a_again.children.is_empty());
    }

    #[tokio::test]
    async fn cycle_leaf_matches_an_ancestor_key() {
        let a = item("A", 1);
        let b = item("B", 20);
        let provider = FakeGraph {
            root: a.clone(),
            callers: HashMap::new(),
            callees: HashMap::from([
                ("A".to_string(), vec![b.clone()]),
                ("B".to_string(), vec![a.clone()]),
            ]),
        };
        let result = build_call_graph(
            Arc::new(provider),
            &a.uri,
            1,
            0,
            CallGraphOptions::default(),
            EntryPoints::bsl_defaults(),
        )
        .await
        .unwrap()
        .unwrap();

        let outgoing = result.outgoing_tree.unwrap();
        let b_node = &outgoing.children[0];
        let cycle_leaf = b_node.children.iter().find(|c| c.is_cycle).unwrap();
        assert_eq!(cycle_leaf.id, node_key(&a));
    }

    #[tokio::test]
    async fn max_nodes_truncates_with_reason() {
        // A wide fan-out: A calls 20 distinct functions.
        let a = item("A", 1);
        let fanout: Vec<CallHierarchyItem> =
            (0..20).map(|i| item(&format!("F{i}"), 100 + i)).collect();
        let provider = FakeGraph {
            root: a.clone(),
            callers: HashMap::new(),
            callees: HashMap::from([("A".to_string(), fanout)]),
        };

        let result = build_call_graph(
            Arc::new(provider),
            &a.uri,
            1,
            0,
            CallGraphOptions {
                depth_up: 1,
                depth_down: 5,
                max_nodes: 5,
            },
            EntryPoints::bsl_defaults(),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(result.truncated);
        assert!(result.truncate_reason.contains("max_nodes"));
        // Racing increments may overshoot by the expansion width.
        assert!(result.total_nodes <= 5 + EXPANSION_WIDTH);
    }

    #[tokio::test]
    async fn depth_cap_limits_descent() {
        // Linear chain A -> B -> C -> D.
        let chain: Vec<CallHierarchyItem> =
            ["A", "B", "C", "D"].iter().enumerate().map(|(i, n)| item(n, i as u32 * 10)).collect();
        let mut callees = HashMap::new();
        for pair in chain.windows(2) {
            callees.insert(pair[0].name.clone(), vec![pair[1].clone()]);
        }
        let provider = FakeGraph {
            root: chain[0].clone(),
            callers: HashMap::new(),
            callees,
        };

        let result = build_call_graph(
            Arc::new(provider),
            &chain[0].uri,
            0,
            0,
            CallGraphOptions {
                depth_up: 1,
                depth_down: 2,
                max_nodes: 100,
            },
            EntryPoints::bsl_defaults(),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(result.max_depth_down_reached, 2);
        // root + B + C; D is beyond the cap.
        assert_eq!(result.total_nodes, 3);
    }

    #[tokio::test]
    async fn entry_points_are_tagged_and_deduplicated() {
        // Two distinct handlers call A; one of them twice via different
        // forms would still be recorded once by name.
        let a = item("A", 1);
        let on_open = item("ПриОткрытии", 50);
        let decorated = item("Форма_ПриОткрытии", 70);
        let provider = FakeGraph {
            root: a.clone(),
            callers: HashMap::from([(
                "A".to_string(),
                vec![on_open.clone(), decorated.clone()],
            )]),
            callees: HashMap::new(),
        };

        let result = build_call_graph(
            Arc::new(provider),
            &a.uri,
            1,
            0,
            CallGraphOptions::default(),
            EntryPoints::bsl_defaults(),
        )
        .await
        .unwrap()
        .unwrap();

        let incoming = result.incoming_tree.expect("incoming tree");
        assert!(incoming.children.iter().all(|c| c.is_entry_point));
        assert_eq!(result.entry_points_found.len(), 2);
        assert!(
            result
                .entry_points_found
                .contains(&"ПриОткрытии".to_string())
        );
    }

    #[tokio::test]
    async fn containers_are_omitted_when_empty() {
        let a = item("A", 1);
        let provider = FakeGraph {
            root: a.clone(),
            callers: HashMap::new(),
            callees: HashMap::new(),
        };
        let result = build_call_graph(
            Arc::new(provider),
            &a.uri,
            1,
            0,
            CallGraphOptions::default(),
            EntryPoints::bsl_defaults(),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(result.incoming_tree.is_none());
        assert!(result.outgoing_tree.is_none());
        assert_eq!(result.total_nodes, 1);
    }

    #[tokio::test]
    async fn result_serializes_with_snake_case_keys() {
        let a = item("A", 1);
        let provider = FakeGraph {
            root: a.clone(),
            callers: HashMap::new(),
            callees: HashMap::new(),
        };
        let result = build_call_graph(
            Arc::new(provider),
            &a.uri,
            1,
            0,
            CallGraphOptions::default(),
            EntryPoints::bsl_defaults(),
        )
        .await
        .unwrap()
        .unwrap();

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["root"]["name"], "A");
        assert_eq!(value["root"]["direction"], "root");
        assert_eq!(value["total_nodes"], 1);
        assert_eq!(value["truncated"], false);
        assert!(value.get("truncate_reason").is_none());
        assert!(value.get("incoming_tree").is_none());
    }
}
