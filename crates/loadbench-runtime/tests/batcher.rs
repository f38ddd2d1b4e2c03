mod common;

use anyhow::Result;
use loadbench_core::QuerySample;
use loadbench_runtime::{BatchPolicy, Batcher};
use proptest::prelude::*;

use common::{samples, VecDataset};

#[test]
fn zero_batch_size_is_rejected() {
    assert!(Batcher::new(BatchPolicy { max_batch: 0 }).is_err());
}

#[test]
fn partitions_are_contiguous_slices() {
    let batcher = Batcher::new(BatchPolicy { max_batch: 3 }).unwrap();
    let input = samples(7);
    let sizes: Vec<usize> = batcher.partition(&input).map(|c| c.len()).collect();
    assert_eq!(sizes, vec![3, 3, 1]);
}

#[test]
fn items_carry_dataset_rows_in_order() -> Result<()> {
    let dataset = VecDataset::new(10);
    let batcher = Batcher::new(BatchPolicy { max_batch: 4 })?;
    let input = samples(6);
    let items = batcher
        .items(&dataset, &input)
        .map(|(_, item)| item)
        .collect::<Result<Vec<_>>>()?;

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].content_ids, vec![0, 1, 2, 3]);
    assert_eq!(items[1].content_ids, vec![4, 5]);
    assert_eq!(items[1].input.to_f32_vec()?, vec![4.0, 5.0]);
    assert_eq!(items[1].labels.as_deref(), Some(&[4, 5][..]));
    assert_eq!(items[0].query_ids[0], input[0].id);
    assert_eq!(dataset.reads.load(std::sync::atomic::Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn failed_read_only_affects_its_partition() {
    let dataset = VecDataset::new(3);
    let batcher = Batcher::new(BatchPolicy { max_batch: 2 }).unwrap();
    let input = vec![
        QuerySample::new(0, 1),
        QuerySample::new(1, 2),
        QuerySample::new(7, 3),
    ];
    let results: Vec<bool> = batcher
        .items(&dataset, &input)
        .map(|(_, item)| item.is_ok())
        .collect();
    assert_eq!(results, vec![true, false]);
}

proptest! {
    #[test]
    fn partitions_concatenate_to_input(n in 1usize..300, max_batch in 1usize..64) {
        let batcher = Batcher::new(BatchPolicy { max_batch }).unwrap();
        let input = samples(n);
        let parts: Vec<&[QuerySample]> = batcher.partition(&input).collect();

        prop_assert!(parts.iter().all(|p| !p.is_empty() && p.len() <= max_batch));
        let joined: Vec<QuerySample> = parts.iter().flat_map(|p| p.iter().copied()).collect();
        prop_assert_eq!(joined, input);
    }
}
