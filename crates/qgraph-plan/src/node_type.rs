//! The closed set of plan node kinds and their stable serialization names.

use serde::{Deserialize, Serialize};

use qgraph_core::error::{Error, Result};

/// Discriminant of a plan node. The numeric values are part of the document
/// format (`typeID`) and must never be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeType {
    Singleton = 1,
    EnumerateCollection = 2,
    EnumerateList = 4,
    Filter = 5,
    Limit = 6,
    Calculation = 7,
    Subquery = 8,
    Sort = 9,
    Collect = 10,
    Scatter = 11,
    Gather = 12,
    Remote = 13,
    Insert = 14,
    Remove = 15,
    Replace = 16,
    Update = 17,
    Return = 18,
    NoResults = 19,
    Distribute = 20,
    Upsert = 21,
    Traversal = 22,
    Index = 23,
    ShortestPath = 24,
    KShortestPaths = 25,
    RemoteSingle = 26,
    EnumerateView = 27,
    DistributeConsumer = 28,
    SubqueryStart = 29,
    SubqueryEnd = 30,
    Materialize = 31,
    Async = 32,
    Mutex = 33,
    Window = 34,
    Join = 35,
}

/// Type id to name table. Every `NodeType` appears exactly once.
const TYPE_NAMES: &[(NodeType, &str)] = &[
    (NodeType::Singleton, "SingletonNode"),
    (NodeType::EnumerateCollection, "EnumerateCollectionNode"),
    (NodeType::EnumerateList, "EnumerateListNode"),
    (NodeType::Filter, "FilterNode"),
    (NodeType::Limit, "LimitNode"),
    (NodeType::Calculation, "CalculationNode"),
    (NodeType::Subquery, "SubqueryNode"),
    (NodeType::Sort, "SortNode"),
    (NodeType::Collect, "CollectNode"),
    (NodeType::Scatter, "ScatterNode"),
    (NodeType::Gather, "GatherNode"),
    (NodeType::Remote, "RemoteNode"),
    (NodeType::Insert, "InsertNode"),
    (NodeType::Remove, "RemoveNode"),
    (NodeType::Replace, "ReplaceNode"),
    (NodeType::Update, "UpdateNode"),
    (NodeType::Return, "ReturnNode"),
    (NodeType::NoResults, "NoResultsNode"),
    (NodeType::Distribute, "DistributeNode"),
    (NodeType::Upsert, "UpsertNode"),
    (NodeType::Traversal, "TraversalNode"),
    (NodeType::Index, "IndexNode"),
    (NodeType::ShortestPath, "ShortestPathNode"),
    (NodeType::KShortestPaths, "KShortestPathsNode"),
    (NodeType::RemoteSingle, "SingleRemoteOperationNode"),
    (NodeType::EnumerateView, "EnumerateViewNode"),
    (NodeType::DistributeConsumer, "DistributeConsumer"),
    (NodeType::SubqueryStart, "SubqueryStartNode"),
    (NodeType::SubqueryEnd, "SubqueryEndNode"),
    (NodeType::Materialize, "MaterializeNode"),
    (NodeType::Async, "AsyncNode"),
    (NodeType::Mutex, "MutexNode"),
    (NodeType::Window, "WindowNode"),
    (NodeType::Join, "JoinNode"),
];

impl NodeType {
    pub const ALL: [NodeType; 34] = [
        NodeType::Singleton,
        NodeType::EnumerateCollection,
        NodeType::EnumerateList,
        NodeType::Filter,
        NodeType::Limit,
        NodeType::Calculation,
        NodeType::Subquery,
        NodeType::Sort,
        NodeType::Collect,
        NodeType::Scatter,
        NodeType::Gather,
        NodeType::Remote,
        NodeType::Insert,
        NodeType::Remove,
        NodeType::Replace,
        NodeType::Update,
        NodeType::Return,
        NodeType::NoResults,
        NodeType::Distribute,
        NodeType::Upsert,
        NodeType::Traversal,
        NodeType::Index,
        NodeType::ShortestPath,
        NodeType::KShortestPaths,
        NodeType::RemoteSingle,
        NodeType::EnumerateView,
        NodeType::DistributeConsumer,
        NodeType::SubqueryStart,
        NodeType::SubqueryEnd,
        NodeType::Materialize,
        NodeType::Async,
        NodeType::Mutex,
        NodeType::Window,
        NodeType::Join,
    ];

    /// Numeric id written as `typeID`.
    pub const fn type_id(self) -> i64 {
        self as u8 as i64
    }

    /// Resolve a `typeID`; ids outside the taxonomy are `NotImplemented`.
    pub fn from_type_id(id: i64) -> Result<Self> {
        TYPE_NAMES
            .iter()
            .find(|(ty, _)| ty.type_id() == id)
            .map(|(ty, _)| *ty)
            .ok_or_else(|| Error::NotImplemented(format!("unknown TypeID {id}")))
    }

    /// Resolve a stable type name such as `"FilterNode"`.
    pub fn from_type_name(name: &str) -> Result<Self> {
        TYPE_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(ty, _)| *ty)
            .ok_or_else(|| Error::NotImplemented(format!("unknown node type '{name}'")))
    }

    /// Stable serialization name.
    pub fn type_name(self) -> &'static str {
        match TYPE_NAMES.iter().find(|(ty, _)| *ty == self) {
            Some((_, name)) => name,
            // The table is exhaustive; see `table_covers_every_type`.
            None => unreachable!("missing type in TypeNames: {self:?}"),
        }
    }

    /// Kinds that open a new register depth during register planning.
    pub fn is_increase_depth(self) -> bool {
        use NodeType::*;
        matches!(
            self,
            EnumerateCollection
                | Index
                | EnumerateList
                | Collect
                | Traversal
                | ShortestPath
                | KShortestPaths
                | RemoteSingle
                | EnumerateView
                | Materialize
                | SubqueryStart
                | SubqueryEnd
                | Join
        )
    }

    /// Whether blocks of this kind always copy input rows into new output rows,
    /// which means an input register may not be reused as an output register.
    pub fn always_copies_rows(self) -> bool {
        use NodeType::*;
        match self {
            EnumerateCollection | EnumerateList | Filter | Sort | Collect | Insert | Remove
            | Replace | Update | NoResults | Distribute | Upsert | Traversal | Index
            | ShortestPath | KShortestPaths | RemoteSingle | EnumerateView
            | DistributeConsumer | SubqueryStart | SubqueryEnd | Materialize | Return | Join => {
                true
            }
            Calculation | Subquery | Singleton | Limit | Window => false,
            Remote | Scatter | Gather | Async | Mutex => false,
        }
    }

    /// Kinds that enumerate rows and therefore form a loop for the nodes above.
    pub fn is_loop(self) -> bool {
        use NodeType::*;
        matches!(
            self,
            EnumerateCollection
                | Index
                | Traversal
                | EnumerateList
                | ShortestPath
                | KShortestPaths
                | EnumerateView
                | Join
        )
    }

    /// Kinds that write documents.
    pub fn is_modification(self) -> bool {
        use NodeType::*;
        matches!(self, Insert | Remove | Replace | Update | Upsert)
    }

    /// Kinds that may read collection data.
    pub fn may_access_collections(self) -> bool {
        use NodeType::*;
        matches!(
            self,
            EnumerateView
                | EnumerateCollection
                | Index
                | Insert
                | Update
                | Replace
                | Remove
                | Upsert
                | Traversal
                | ShortestPath
                | KShortestPaths
                | Join
        )
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}
