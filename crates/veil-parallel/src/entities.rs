use std::future::Future;

use futures::future::join_all;
use tracing::warn;
use veil_types::{Entity, SensitiveSpan};

/// Splits `entities` into fixed-size batches, runs `process_batch` over
/// each concurrently, and concatenates the processed entities and
/// redaction spans in batch order. A failed batch contributes nothing but
/// does not fail the page.
pub async fn process_entities_in_parallel<F, Fut>(
    entities: Vec<Entity>,
    batch_size: usize,
    process_batch: F,
) -> (Vec<Entity>, Vec<SensitiveSpan>)
where
    F: Fn(Vec<Entity>) -> Fut,
    Fut: Future<Output = anyhow::Result<(Vec<Entity>, Vec<SensitiveSpan>)>>,
{
    if entities.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let batch_size = batch_size.max(1);

    let mut batches: Vec<Vec<Entity>> = Vec::new();
    let mut current = Vec::with_capacity(batch_size);
    for entity in entities {
        current.push(entity);
        if current.len() == batch_size {
            batches.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }

    let outcomes = join_all(batches.into_iter().map(|batch| process_batch(batch))).await;

    let mut processed = Vec::new();
    let mut sensitive = Vec::new();
    for (batch_index, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok((mut p, mut s)) => {
                processed.append(&mut p);
                sensitive.append(&mut s);
            }
            Err(error) => {
                warn!(batch_index, error = %error, "Entity batch failed, skipping");
            }
        }
    }
    (processed, sensitive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_types::BoundingBox;

    fn entity(name: &str, start: usize) -> Entity {
        Entity {
            entity_type: name.to_string(),
            start,
            end: start + 1,
            score: 0.9,
            original_text: "x".to_string(),
        }
    }

    fn span(start: usize) -> SensitiveSpan {
        SensitiveSpan {
            entity_type: "T".into(),
            score: 0.9,
            bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            start,
            end: start + 1,
            original_text: None,
        }
    }

    #[tokio::test]
    async fn test_empty_input_returns_empty() {
        let (processed, sensitive) =
            process_entities_in_parallel(Vec::new(), 10, |batch| async move {
                Ok((batch, Vec::new()))
            })
            .await;
        assert!(processed.is_empty());
        assert!(sensitive.is_empty());
    }

    #[tokio::test]
    async fn test_batching_preserves_order_and_concatenates() {
        let input: Vec<Entity> = (0..25).map(|i| entity("T", i)).collect();
        let (processed, sensitive) =
            process_entities_in_parallel(input, 10, |batch| async move {
                let spans = batch.iter().map(|e| span(e.start)).collect();
                Ok((batch, spans))
            })
            .await;
        assert_eq!(processed.len(), 25);
        assert_eq!(sensitive.len(), 25);
        let starts: Vec<usize> = processed.iter().map(|e| e.start).collect();
        assert_eq!(starts, (0..25).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failed_batch_is_skipped() {
        let input: Vec<Entity> = (0..20).map(|i| entity("T", i)).collect();
        let (processed, _) = process_entities_in_parallel(input, 10, |batch| async move {
            if batch[0].start == 0 {
                anyhow::bail!("first batch fails");
            }
            Ok((batch, Vec::new()))
        })
        .await;
        // Only the second batch survives.
        assert_eq!(processed.len(), 10);
        assert_eq!(processed[0].start, 10);
    }
}
