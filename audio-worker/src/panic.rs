//! Panics of spawned tasks surface as a `JoinError` carrying a `Box<dyn Any + Send>` payload. These
//! helpers pull the panic message out of such a payload so it can be logged.

use std::any::Any;

/// Returns the message of a panic payload, if it carries one.
pub fn panic_message(payload: &(dyn Any + Send)) -> Option<&str> {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
}

/// Formats a panic payload behind `context`.
pub fn panic_to_string(context: &str, payload: Box<dyn Any + Send>) -> String {
    match panic_message(&*payload) {
        Some(msg) => format!("{context}: {msg}"),
        None => format!("{context} (no message)"),
    }
}

#[cfg(test)]
mod tests {
    use super::panic_to_string;

    #[test]
    fn extracts_messages() {
        assert_eq!(panic_to_string("ctx", Box::new("boom")), "ctx: boom");
        assert_eq!(
            panic_to_string("ctx", Box::new(String::from("bang"))),
            "ctx: bang"
        );
        assert_eq!(panic_to_string("ctx", Box::new(42u8)), "ctx (no message)");
    }

    #[tokio::test]
    async fn works_on_join_errors() {
        let err = tokio::spawn(async { panic!("dispatcher blew up") })
            .await
            .unwrap_err();
        assert_eq!(
            panic_to_string("task", err.into_panic()),
            "task: dispatcher blew up"
        );
    }
}
