//! Helpers for testing.
#![allow(unused)]

/// A macro for making assertions about the jobs taken from a queue.
///
/// Pass the jobs drained from a [`crate::queue::JobReceiver`] and any number of filters. Without
/// a count, at least one job has to match.
///
/// # Example
///
/// ```
/// # use dreamqueue::prelude::*;
/// # use dreamqueue::testing::assert_enqueued;
/// # struct Words;
/// # impl PromptSource for Words {
/// #     fn generate(&self, seed_text: &str, _: f64) -> Option<String> {
/// #         Some(format!("{seed_text} in the rain"))
/// #     }
/// # }
/// let (queue, mut receiver) = dreamqueue::queue::channel();
/// queue.push(JobBuilder::new("cat seed=42 steps=30", "100").build(&Words));
/// queue.push(JobBuilder::new("dog+", "200").with_count(2).build(&Words));
///
/// let jobs = receiver.drain();
///
/// assert_enqueued!(in: jobs, with_prompt: "cat", with_seed: 42, with_steps: 30);
/// assert_enqueued!(
///     1 job,
///     in: jobs,
///     with_prompt: "dog in the rain",
///     with_count: 2,
///     for_target: "200",
/// );
/// assert_enqueued!(0 jobs, in: jobs, with_prompt: "dog");
/// ```
#[macro_export]
macro_rules! assert_enqueued {
    (1 job, in: $jobs:expr, $($tail:tt)*) => {
        $crate::assert_enqueued!(@internal 1 in: $jobs, $($tail)*);
    };
    ($n:literal jobs, in: $jobs:expr, $($tail:tt)*) => {
        $crate::assert_enqueued!(@internal $n in: $jobs, $($tail)*);
    };
    (in: $jobs:expr, $($tail:tt)*) => {
        $crate::assert_enqueued!(@internal any in: $jobs, $($tail)*);
    };
    (@internal $n:tt in: $jobs:expr, $($tail:tt)*) => {{
        let all_jobs: &[$crate::job::Job] = &$jobs;
        let mut filters: Vec<Box<dyn Fn(&$crate::job::Job) -> bool + '_>> = Vec::new();
        $crate::assert_enqueued!(@filter filters; $($tail)*);
        let jobs = all_jobs
            .iter()
            .filter(|job| filters.iter().all(|filter| filter(*job)))
            .collect::<Vec<_>>();
        $crate::assert_enqueued!(@check $n, jobs, all_jobs, stringify!($($tail)*));
    }};
    (@check any, $jobs:ident, $all_jobs:ident, $query:expr) => {
        assert!(
            !$jobs.is_empty(),
            "No jobs enqueued {}\n\nAll enqueued jobs:\n{:#?}",
            $query,
            $all_jobs,
        );
    };
    (@check $n:literal, $jobs:ident, $all_jobs:ident, $query:expr) => {
        assert!(
            $jobs.len() == $n,
            "Unexpected number of jobs enqueued {},\n\n\
            Expected {} jobs, found {} matching jobs:\n\n\
            Matching jobs:\n\
            {:#?}\n\n\
            All enqueued jobs:\n\
            {:#?}",
            $query,
            $n,
            $jobs.len(),
            $jobs,
            $all_jobs,
        );
    };
    (@filter $vec:ident; with_prompt: $prompt:expr $(, $($tail:tt)*)?) => {
        let expected = $prompt;
        $vec.push(Box::new(move |job: &$crate::job::Job| job.prompt == expected));
        $($crate::assert_enqueued!(@filter $vec; $($tail)*);)?
    };
    (@filter $vec:ident; for_target: $target:expr $(, $($tail:tt)*)?) => {
        let expected = $crate::job::Destination::from($target);
        $vec.push(Box::new(move |job: &$crate::job::Job| job.target == expected));
        $($crate::assert_enqueued!(@filter $vec; $($tail)*);)?
    };
    (@filter $vec:ident; with_seed: $seed:expr $(, $($tail:tt)*)?) => {
        let expected: u32 = $seed;
        $vec.push(Box::new(move |job: &$crate::job::Job| job.params.seed == expected));
        $($crate::assert_enqueued!(@filter $vec; $($tail)*);)?
    };
    (@filter $vec:ident; with_steps: $steps:expr $(, $($tail:tt)*)?) => {
        let expected: u32 = $steps;
        $vec.push(Box::new(move |job: &$crate::job::Job| job.params.steps == expected));
        $($crate::assert_enqueued!(@filter $vec; $($tail)*);)?
    };
    (@filter $vec:ident; with_scale: $scale:expr $(, $($tail:tt)*)?) => {
        let expected: f64 = $scale;
        $vec.push(Box::new(move |job: &$crate::job::Job| job.params.scale == expected));
        $($crate::assert_enqueued!(@filter $vec; $($tail)*);)?
    };
    (@filter $vec:ident; with_count: $count:expr $(, $($tail:tt)*)?) => {
        let expected: u32 = $count;
        $vec.push(Box::new(move |job: &$crate::job::Job| job.params.count == expected));
        $($crate::assert_enqueued!(@filter $vec; $($tail)*);)?
    };
    (@filter $vec:ident; with_status_message $(, $($tail:tt)*)?) => {
        $vec.push(Box::new(|job: &$crate::job::Job| job.status_message.is_some()));
        $($crate::assert_enqueued!(@filter $vec; $($tail)*);)?
    };
    (@filter $vec:ident;) => {};
}

pub use assert_enqueued;

#[cfg(test)]
pub(crate) use fakes::*;
