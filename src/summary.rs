//! Summary subjects, storage and dependency-driven computation.
//!
//! A summary describes the effect of a function or a loop. Subjects are
//! interned in a [`SubjectTable`], so asking twice for the same function or
//! loop yields the same [`Arc`]. Summaries are opaque to the engine: each
//! domain downcasts the [`SummaryInstance`]s it understands and ignores the
//! rest.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

use indexmap::{IndexMap, IndexSet};
use log::{debug, info};

use crate::cfa::{Cfa, Loop};
use crate::error::Result;
use crate::shutdown::ShutdownNotifier;
use crate::types::{LoopId, NodeId};

/// An opaque summary value.
///
/// Blanket-implemented for every `Any + Debug + PartialEq + Send + Sync` type.
pub trait SummaryInstance: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn is_equal_to(&self, other: &dyn SummaryInstance) -> bool;
}

impl<T> SummaryInstance for T
where
    T: Any + fmt::Debug + PartialEq + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_equal_to(&self, other: &dyn SummaryInstance) -> bool {
        other.as_any().downcast_ref::<T>().map_or(false, |o| self == o)
    }
}

impl dyn SummaryInstance {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FunctionKey {
    Entry(NodeId),
    Name(String),
}

/// A function, identified by its entry node if it has a body, else by name.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct FunctionSubject {
    name: String,
    entry: Option<NodeId>,
}

impl FunctionSubject {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> Option<NodeId> {
        self.entry
    }

    /// Whether the function has no body in the CFA.
    pub fn is_external(&self) -> bool {
        self.entry.is_none()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LoopSummaryKind {
    /// Replaces the whole loop: from the entering state to the exit edges.
    External,
    /// Refines the state right after entering the loop.
    Internal,
}

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct LoopSubject {
    loop_id: LoopId,
    head: NodeId,
    kind: LoopSummaryKind,
}

impl LoopSubject {
    pub fn loop_id(&self) -> LoopId {
        self.loop_id
    }

    pub fn head(&self) -> NodeId {
        self.head
    }

    pub fn kind(&self) -> LoopSummaryKind {
        self.kind
    }
}

/// Anything a summary can be attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    Function(Arc<FunctionSubject>),
    Loop(Arc<LoopSubject>),
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Function(s) => write!(f, "function {}", s.name),
            Subject::Loop(s) => write!(f, "{:?} summary of {} at {}", s.kind, s.loop_id, s.head),
        }
    }
}

/// Interning table for subjects.
#[derive(Debug, Default)]
pub struct SubjectTable {
    functions: Mutex<IndexMap<FunctionKey, Arc<FunctionSubject>>>,
    loops: Mutex<IndexMap<(LoopId, LoopSummaryKind), Arc<LoopSubject>>>,
}

impl SubjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The subject of function `name`: keyed by its entry node when `cfa`
    /// defines it, by name otherwise.
    pub fn function(&self, cfa: &Cfa, name: &str) -> Arc<FunctionSubject> {
        match cfa.function(name) {
            Some(info) => self.intern_function(FunctionKey::Entry(info.entry), name, Some(info.entry)),
            None => self.external_function(name),
        }
    }

    /// The subject of a function without a body.
    pub fn external_function(&self, name: &str) -> Arc<FunctionSubject> {
        self.intern_function(FunctionKey::Name(name.to_string()), name, None)
    }

    fn intern_function(&self, key: FunctionKey, name: &str, entry: Option<NodeId>) -> Arc<FunctionSubject> {
        let mut functions = self.functions.lock().unwrap_or_else(|e| e.into_inner());
        functions
            .entry(key)
            .or_insert_with(|| {
                Arc::new(FunctionSubject {
                    name: name.to_string(),
                    entry,
                })
            })
            .clone()
    }

    pub fn loop_subject(&self, loop_info: &Loop, kind: LoopSummaryKind) -> Arc<LoopSubject> {
        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        loops
            .entry((loop_info.id, kind))
            .or_insert_with(|| {
                Arc::new(LoopSubject {
                    loop_id: loop_info.id,
                    head: loop_info.head,
                    kind,
                })
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        let functions = self.functions.lock().unwrap_or_else(|e| e.into_inner()).len();
        let loops = self.loops.lock().unwrap_or_else(|e| e.into_inner()).len();
        functions + loops
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Summaries per subject.
#[derive(Debug, Default)]
pub struct SummaryStore {
    entries: IndexMap<Subject, Vec<Arc<dyn SummaryInstance>>>,
}

impl SummaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, subject: &Subject) -> &[Arc<dyn SummaryInstance>] {
        self.entries.get(subject).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, subject: &Subject) -> bool {
        self.entries.get(subject).map_or(false, |v| !v.is_empty())
    }

    pub fn push(&mut self, subject: Subject, summary: Arc<dyn SummaryInstance>) {
        self.entries.entry(subject).or_default().push(summary);
    }

    /// Replaces the summaries of `subject`. Returns whether they changed.
    pub fn update(&mut self, subject: Subject, summaries: Vec<Arc<dyn SummaryInstance>>) -> bool {
        let changed = match self.entries.get(&subject) {
            None => true,
            Some(old) => {
                old.len() != summaries.len() || old.iter().zip(&summaries).any(|(a, b)| !a.is_equal_to(&**b))
            }
        };
        self.entries.insert(subject, summaries);
        changed
    }

    pub fn subjects(&self) -> impl Iterator<Item = &Subject> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Subjects and their summaries, as consulted by the reachability loop.
#[derive(Debug, Default)]
pub struct SummaryProvider {
    subjects: SubjectTable,
    store: SummaryStore,
}

impl SummaryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subjects(&self) -> &SubjectTable {
        &self.subjects
    }

    pub fn store(&self) -> &SummaryStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SummaryStore {
        &mut self.store
    }

    pub fn function_summaries(&self, cfa: &Cfa, callee: &str) -> Vec<Arc<dyn SummaryInstance>> {
        let subject = Subject::Function(self.subjects.function(cfa, callee));
        self.store.get(&subject).to_vec()
    }

    pub fn loop_summaries(&self, loop_info: &Loop, kind: LoopSummaryKind) -> Vec<Arc<dyn SummaryInstance>> {
        let subject = Subject::Loop(self.subjects.loop_subject(loop_info, kind));
        self.store.get(&subject).to_vec()
    }

    pub fn add_function_summary(&mut self, cfa: &Cfa, callee: &str, summary: impl SummaryInstance) {
        let subject = Subject::Function(self.subjects.function(cfa, callee));
        self.store.push(subject, Arc::new(summary));
    }

    pub fn add_loop_summary(&mut self, loop_info: &Loop, kind: LoopSummaryKind, summary: impl SummaryInstance) {
        let subject = Subject::Loop(self.subjects.loop_subject(loop_info, kind));
        self.store.push(subject, Arc::new(summary));
    }
}

/// Which subjects' summaries depend on which.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    subjects: IndexSet<Subject>,
    /// Subjects depending on the key.
    dependers: IndexMap<Subject, IndexSet<Subject>>,
    /// Subjects the key depends on.
    dependees: IndexMap<Subject, IndexSet<Subject>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every function depends on its callees.
    pub fn from_call_graph(cfa: &Cfa, table: &SubjectTable) -> Self {
        let mut graph = Self::new();
        for info in cfa.functions() {
            let caller = Subject::Function(table.function(cfa, &info.name));
            graph.add_subject(caller.clone());
            for callee in cfa.callees(&info.name) {
                graph.add_dependency(caller.clone(), Subject::Function(table.function(cfa, callee)));
            }
        }
        graph
    }

    pub fn add_subject(&mut self, subject: Subject) {
        self.subjects.insert(subject);
    }

    /// Records that the summary of `depender` is computed from that of `dependee`.
    pub fn add_dependency(&mut self, depender: Subject, dependee: Subject) {
        self.add_subject(depender.clone());
        self.add_subject(dependee.clone());
        self.dependers.entry(dependee.clone()).or_default().insert(depender.clone());
        self.dependees.entry(depender).or_default().insert(dependee);
    }

    pub fn subjects(&self) -> impl Iterator<Item = &Subject> {
        self.subjects.iter()
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    pub fn dependers(&self, subject: &Subject) -> impl Iterator<Item = &Subject> {
        self.dependers.get(subject).into_iter().flatten()
    }

    pub fn dependees(&self, subject: &Subject) -> impl Iterator<Item = &Subject> {
        self.dependees.get(subject).into_iter().flatten()
    }

    /// Repeatedly picks the subject with the fewest unprocessed dependees,
    /// breaking ties by insertion order. Callees come before callers, and
    /// recursive cycles are entered at their least dependent member.
    pub fn computation_order(&self) -> Vec<Subject> {
        let mut out_degree: Vec<usize> = self
            .subjects
            .iter()
            .map(|s| self.dependees.get(s).map_or(0, |d| d.len()))
            .collect();
        let mut done = vec![false; self.subjects.len()];
        let mut order = Vec::with_capacity(self.subjects.len());
        while order.len() < self.subjects.len() {
            let Some(next) = (0..self.subjects.len())
                .filter(|&i| !done[i])
                .min_by_key(|&i| (out_degree[i], i))
            else {
                break;
            };
            done[next] = true;
            let subject = &self.subjects[next];
            for depender in self.dependers(subject) {
                if let Some(j) = self.subjects.get_index_of(depender) {
                    out_degree[j] = out_degree[j].saturating_sub(1);
                }
            }
            order.push(subject.clone());
        }
        order
    }
}

/// FIFO of subjects where touching an element moves it to the back.
#[derive(Debug, Default)]
struct SubjectWaitlist {
    queue: IndexSet<Subject>,
}

impl SubjectWaitlist {
    fn pop(&mut self) -> Option<Subject> {
        self.queue.shift_remove_index(0)
    }

    fn touch(&mut self, subject: Subject) {
        self.queue.shift_remove(&subject);
        self.queue.insert(subject);
    }
}

/// Computes the summaries of one subject from the current store.
pub trait SummaryComputer {
    fn compute(&mut self, subject: &Subject, store: &SummaryStore) -> Result<Vec<Arc<dyn SummaryInstance>>>;
}

impl<F> SummaryComputer for F
where
    F: FnMut(&Subject, &SummaryStore) -> Result<Vec<Arc<dyn SummaryInstance>>>,
{
    fn compute(&mut self, subject: &Subject, store: &SummaryStore) -> Result<Vec<Arc<dyn SummaryInstance>>> {
        self(subject, store)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryStatistics {
    pub computations: usize,
    pub updates: usize,
    /// Whether the computation ran until no summary changed.
    pub saturated: bool,
}

/// Computes summaries for every subject of `graph` until saturation.
///
/// Whenever the summaries of a subject change, its dependers are touched:
/// queued again, or moved to the back if already queued. Termination relies
/// on the computer producing eventually stable summaries; a shutdown ends the
/// computation unsaturated.
pub fn compute_summaries(
    graph: &DependencyGraph,
    provider: &mut SummaryProvider,
    computer: &mut dyn SummaryComputer,
    shutdown: &ShutdownNotifier,
) -> Result<SummaryStatistics> {
    let mut stats = SummaryStatistics::default();
    let mut waitlist = SubjectWaitlist::default();
    for subject in graph.computation_order() {
        waitlist.touch(subject);
    }

    while let Some(subject) = waitlist.pop() {
        if shutdown.should_shutdown() {
            info!("summary computation interrupted with {} subjects pending", waitlist.queue.len() + 1);
            return Ok(stats);
        }
        stats.computations += 1;
        let summaries = computer.compute(&subject, provider.store())?;
        if provider.store_mut().update(subject.clone(), summaries) {
            stats.updates += 1;
            debug!("summary of {} changed", subject);
            for depender in graph.dependers(&subject) {
                waitlist.touch(depender.clone());
            }
        }
    }

    stats.saturated = true;
    info!(
        "summary computation saturated after {} computations ({} updates)",
        stats.computations, stats.updates
    );
    Ok(stats)
}
