use minijinja::{context, Environment};

const ADMIN_NOTIFICATION_TEMPLATE: &str = include_str!("templates/admin_notification.j2");

/// Sent back on the admin channel when a message there does not reply to a
/// relayed notification, so the sender knows it cannot be attributed.
pub const REPLY_WARNING_TEXT: &str =
    "⚠️ **Please reply to a specific message.**\n\nI need to know which customer you are talking to.";

/// Render the admin-channel notification for a customer message. Falls back to
/// a hand-built string if the template fails to render.
pub fn render_admin_notification(customer_name: &str, content: &str) -> String {
    let name = if customer_name.trim().is_empty() {
        "Guest"
    } else {
        customer_name.trim()
    };

    let mut env = Environment::new();
    if env
        .add_template("admin_notification", ADMIN_NOTIFICATION_TEMPLATE)
        .is_err()
    {
        return fallback_notification(name, content);
    }

    let Ok(template) = env.get_template("admin_notification") else {
        return fallback_notification(name, content);
    };

    template
        .render(context! {
            customer_name => name,
            content => content,
        })
        .unwrap_or_else(|_| fallback_notification(name, content))
}

fn fallback_notification(name: &str, content: &str) -> String {
    format!("📩 *New Message from {name}*\n\n{content}\n\n_Reply to this message to chat back._")
}
