//! Tests for error types.

use super::*;

#[test]
fn test_error_transience() {
    assert!(QueueError::ConnectionFailed {
        destination: "IN@QM/HOST/1414".to_string(),
        message: "refused".to_string(),
    }
    .is_transient());

    assert!(QueueError::ReceiveFailed {
        destination: "IN@QM/HOST/1414".to_string(),
        message: "broken pipe".to_string(),
    }
    .is_transient());

    assert!(!QueueError::PoolClosed {
        pool: "producers".to_string(),
    }
    .is_transient());

    assert!(!QueueError::Configuration(ConfigurationError::Missing {
        key: "input_queue".to_string(),
    })
    .is_transient());
}

#[test]
fn test_transaction_error_transience() {
    let id = TransactionId::new();

    assert!(TransactionError::Aborted {
        id,
        reason: "participant voted to roll back".to_string(),
    }
    .is_transient());

    assert!(!TransactionError::NoAmbientTransaction.is_transient());
    assert!(!TransactionError::AlreadyCompleted { id }.is_transient());

    let wrapped: QueueError = TransactionError::TimedOut {
        id,
        elapsed: Duration::from_secs(3),
        timeout: Duration::from_secs(1),
    }
    .into();
    assert!(wrapped.is_transient());
}

#[test]
fn test_error_messages_name_the_destination() {
    let error = QueueError::SendFailed {
        destination: "ORDERS@QM1/MQHOST/1414/SVRCONN".to_string(),
        message: "queue full".to_string(),
    };

    let text = error.to_string();
    assert!(text.contains("ORDERS@QM1/MQHOST/1414/SVRCONN"));
    assert!(text.contains("queue full"));
}
