//! The directory/workspace scheduler.
//!
//! Dirspaces are grouped into rank tiers (a strict barrier: later ranks
//! may depend on state created by earlier ones) and, within a tier, into
//! round-robin sub-batches taking at most one pending workspace per path.
//! Workspaces sharing a path therefore never run concurrently (they share
//! local engine state like `.terraform`), while distinct paths race freely
//! inside a semaphore-bounded task pool.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use futures::future;
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::run_state::RunState;
use crate::work_exec::{DirspaceResult, ExecStrategy};
use crate::work_manifest::Dirspace;

/// Partition dirspaces into ordered batches: tiers by ascending rank, then
/// rows taking one workspace per path until a tier is exhausted.
pub fn order_dirspaces(dirs: &[Dirspace]) -> Vec<Vec<Dirspace>> {
    let mut ranking: BTreeMap<i64, Vec<(String, VecDeque<Dirspace>)>> = BTreeMap::new();

    for d in dirs {
        let tier = ranking.entry(d.rank).or_default();
        match tier.iter_mut().find(|(path, _)| path == &d.path) {
            Some((_, queue)) => queue.push_back(d.clone()),
            None => tier.push((d.path.clone(), VecDeque::from([d.clone()]))),
        }
    }

    let mut ret = Vec::new();
    for (_, mut tier) in ranking {
        loop {
            let mut row = Vec::new();
            for (_, queue) in tier.iter_mut() {
                if let Some(d) = queue.pop_front() {
                    row.push(d);
                }
            }
            if row.is_empty() {
                break;
            }
            ret.push(row);
        }
    }

    ret
}

/// Run every dirspace through the strategy with bounded parallelism. Each
/// worker receives its own state snapshot; the caller folds the outcomes.
/// Worker errors are configuration-class and abort the run.
pub async fn run(
    parallelism: usize,
    dirspaces: &[Dirspace],
    state: &RunState,
    strategy: Arc<dyn ExecStrategy>,
) -> Result<Vec<(RunState, DirspaceResult)>> {
    let batches = order_dirspaces(dirspaces);
    let mut results = Vec::new();

    for batch in batches {
        let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
        let mut handles = Vec::new();

        for d in batch {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore is never closed");
            let state = state.clone();
            let strategy = strategy.clone();
            let task_dirspace = d.clone();

            handles.push((
                tokio::spawn(async move {
                    let res = strategy.exec(state, &task_dirspace).await;
                    drop(permit);
                    res
                }),
                d,
            ));
        }

        // The whole sub-batch completes before the next row starts; this
        // is what serializes same-path workspaces.
        let joined = future::join_all(handles.iter_mut().map(|(h, _)| h)).await;
        for (join_res, (_, d)) in joined.into_iter().zip(handles) {
            match join_res {
                Ok(Ok(pair)) => results.push(pair),
                Ok(Err(e)) => {
                    tracing::error!("EXEC : DIR : {} : {} : {e}", d.path, d.workspace);
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!("EXEC : DIR : {} : {} : worker panicked", d.path, d.workspace);
                    return Err(Error::Other(format!("worker panicked: {e}")));
                }
            }
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_state::fixtures;
    use crate::runtime::RunType;
    use crate::workflow::Step;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn ds(path: &str, workspace: &str, rank: i64) -> Dirspace {
        Dirspace::new(path, workspace, rank)
    }

    #[test]
    fn orders_by_rank_then_serializes_paths() {
        let batches = order_dirspaces(&[
            ds("d1", "ws1", 0),
            ds("d1", "ws2", 0),
            ds("d2", "ws1", 1),
        ]);

        // Two rows for d1's workspaces, then the rank-1 row.
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], vec![ds("d1", "ws1", 0)]);
        assert_eq!(batches[1], vec![ds("d1", "ws2", 0)]);
        assert_eq!(batches[2], vec![ds("d2", "ws1", 1)]);
    }

    #[test]
    fn distinct_paths_share_a_row() {
        let batches = order_dirspaces(&[
            ds("a", "default", 0),
            ds("b", "default", 0),
            ds("a", "staging", 0),
        ]);

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], vec![ds("a", "default", 0), ds("b", "default", 0)]);
        assert_eq!(batches[1], vec![ds("a", "staging", 0)]);
    }

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(order_dirspaces(&[]).is_empty());
    }

    #[derive(Clone, Copy, Debug, PartialEq)]
    enum Event {
        Start,
        End,
    }

    struct RecordingStrategy {
        events: Mutex<Vec<(Dirspace, Event, Instant)>>,
    }

    impl RecordingStrategy {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ExecStrategy for RecordingStrategy {
        fn run_type(&self) -> RunType {
            RunType::Plan
        }

        fn pre_hooks(&self, _state: &RunState) -> crate::error::Result<Vec<Step>> {
            Ok(Vec::new())
        }

        fn post_hooks(&self, _state: &RunState) -> crate::error::Result<Vec<Step>> {
            Ok(Vec::new())
        }

        async fn exec(
            &self,
            state: RunState,
            d: &Dirspace,
        ) -> crate::error::Result<(RunState, DirspaceResult)> {
            self.events
                .lock()
                .unwrap()
                .push((d.clone(), Event::Start, Instant::now()));

            tokio::time::sleep(Duration::from_millis(25)).await;

            self.events
                .lock()
                .unwrap()
                .push((d.clone(), Event::End, Instant::now()));

            Ok((
                state,
                DirspaceResult {
                    path: d.path.clone(),
                    workspace: d.workspace.clone(),
                    success: true,
                    outputs: Vec::new(),
                },
            ))
        }
    }

    fn interval(
        events: &[(Dirspace, Event, Instant)],
        d: &Dirspace,
    ) -> (Instant, Instant) {
        let start = events
            .iter()
            .find(|(e, ev, _)| e == d && *ev == Event::Start)
            .unwrap()
            .2;
        let end = events
            .iter()
            .find(|(e, ev, _)| e == d && *ev == Event::End)
            .unwrap()
            .2;
        (start, end)
    }

    #[tokio::test]
    async fn same_path_never_overlaps_and_ranks_are_barriers() {
        let strategy = Arc::new(RecordingStrategy::new());
        let state = fixtures::state();
        let dirspaces = vec![
            ds("d1", "ws1", 0),
            ds("d1", "ws2", 0),
            ds("d2", "ws1", 1),
        ];

        let results = run(4, &dirspaces, &state, strategy.clone())
            .await
            .unwrap();
        assert_eq!(results.len(), 3);

        let events = strategy.events.lock().unwrap().clone();
        let (s1, e1) = interval(&events, &dirspaces[0]);
        let (s2, e2) = interval(&events, &dirspaces[1]);
        let (s3, _) = interval(&events, &dirspaces[2]);

        // d1/ws1 and d1/ws2 are serialized.
        assert!(e1 <= s2 || e2 <= s1, "same-path workspaces overlapped");
        // Rank 1 starts only after every rank 0 entry finished.
        assert!(s3 >= e1 && s3 >= e2, "rank barrier violated");
    }

    #[tokio::test]
    async fn distinct_paths_run_concurrently() {
        let strategy = Arc::new(RecordingStrategy::new());
        let state = fixtures::state();
        let dirspaces = vec![ds("a", "default", 0), ds("b", "default", 0)];

        run(4, &dirspaces, &state, strategy.clone()).await.unwrap();

        let events = strategy.events.lock().unwrap().clone();
        let (s1, e1) = interval(&events, &dirspaces[0]);
        let (s2, e2) = interval(&events, &dirspaces[1]);

        assert!(s1 < e2 && s2 < e1, "distinct paths did not overlap");
    }

    #[tokio::test]
    async fn empty_dirspaces_trivially_succeed() {
        let strategy = Arc::new(RecordingStrategy::new());
        let state = fixtures::state();

        let results = run(4, &[], &state, strategy).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn single_dirspace_goes_through_the_batch_machinery() {
        let strategy = Arc::new(RecordingStrategy::new());
        let state = fixtures::state();

        let results = run(1, &[ds("only", "default", 7)], &state, strategy)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.path, "only");
    }
}
