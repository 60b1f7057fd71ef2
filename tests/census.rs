//! Census end-to-end scenarios.

mod common;

use num_bigint::BigUint;
use uuid::Uuid;

use zkvoting_sequencer::census::CensusRegistry;
use zkvoting_sequencer::errors::Error;

#[tokio::test]
async fn happy_census() {
    let harness = common::harness().await;
    let censuses = &harness.sequencer.censuses;
    let id = Uuid::new_v4();
    censuses.create(id).await.unwrap();

    let rows = vec![
        (vec![0x01; 20], BigUint::from(1u8)),
        (vec![0x02; 20], BigUint::from(1u8)),
    ];
    let outcome = censuses.insert_batch(&id, &rows).await.unwrap();
    assert!(outcome.invalid.is_empty());
    assert_eq!(censuses.size(&id).await.unwrap(), 2);

    let proof = censuses.prove(&id, &[0x01; 20]).await.unwrap();
    assert_eq!(proof.root, censuses.root(&id).await.unwrap());
    assert!(CensusRegistry::verify_proof(&proof).unwrap());
}

#[tokio::test]
async fn root_reindex() {
    let harness = common::harness().await;
    let censuses = &harness.sequencer.censuses;
    let id = Uuid::new_v4();
    censuses.create(id).await.unwrap();
    let root_a = censuses.root(&id).await.unwrap();

    let k1 = vec![0x11; 20];
    let outcome = censuses
        .insert_batch(&id, &[(k1.clone(), BigUint::from(1u8))])
        .await
        .unwrap();
    let root_b = outcome.root;
    assert_ne!(root_a, root_b);

    // the stale root must no longer resolve
    assert!(matches!(
        censuses.proof_by_root(&root_a, &k1).await,
        Err(Error::NotFound(_))
    ));
    let proof = censuses.proof_by_root(&root_b, &k1).await.unwrap();
    assert!(CensusRegistry::verify_proof(&proof).unwrap());
}

#[tokio::test]
async fn duplicate_census_conflicts() {
    let harness = common::harness().await;
    let censuses = &harness.sequencer.censuses;
    let id = Uuid::new_v4();
    censuses.create(id).await.unwrap();
    let err = censuses.create(id).await.unwrap_err();
    assert_eq!(err.code(), 40007);
}

#[tokio::test]
async fn delete_census_rejects_writers() {
    let harness = common::harness().await;
    let censuses = &harness.sequencer.censuses;
    let id = Uuid::new_v4();
    censuses.create(id).await.unwrap();
    censuses.delete(&id).await.unwrap();
    let err = censuses
        .insert(&id, &[0x01; 20], &BigUint::from(1u8))
        .await
        .unwrap_err();
    assert_eq!(err.code(), 40009);
}
