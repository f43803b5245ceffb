//! Invoice payload as served by the upstream invoice service, and the HTML
//! templates built from it.

use serde::Deserialize;
use serde_json::Value;
use std::fmt::Write as _;

const LOGO_URL: &str = "https://regalchocolate.in/static/images/Logo_small.png";
const PACKAGE_ICON_URL: &str = "https://regalchocolate.in/static/images/box.png";
const SUPPORT_EMAIL: &str = "support@regalchocolate.in";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InvoicePayload {
    pub order_id: String,
    pub created_at_formatted: String,
    pub status: String,
    pub shipping_address: ShippingAddress,
    pub items: Vec<InvoiceItem>,
    pub total_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ShippingAddress {
    pub street: String,
    pub city: String,
    pub postcode: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InvoiceItem {
    pub product_name: String,
    #[serde(default)]
    pub product_image: Option<String>,
    // Upstream sends these as either numbers or strings.
    #[serde(default)]
    pub box_id: Option<Value>,
    #[serde(default)]
    pub shipment_id: Option<Value>,
    pub quantity: i64,
    pub price_at_purchase: f64,
    pub line_total: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvoiceDocument {
    Html(String),
    Structured(InvoicePayload),
}

impl InvoiceDocument {
    pub fn to_html(&self) -> String {
        match self {
            InvoiceDocument::Html(html) => html.clone(),
            InvoiceDocument::Structured(payload) => compose_invoice_html(payload),
        }
    }
}

pub fn compose_invoice_html(invoice: &InvoicePayload) -> String {
    let mut rows = String::new();
    for item in &invoice.items {
        let name = escape(&item.product_name);
        let image = escape(item.product_image.as_deref().unwrap_or(""));
        let _ = write!(
            rows,
            r#"
        <tr>
          <td align="center" style="padding: 12px; border: 1px solid #dee2e6;">
            <img src="{image}" alt="{name}" style="max-width: 100px; height: 100px; object-fit: cover; border: 1px solid #dee2e6; border-radius: 4px;">
          </td>
          <td style="padding: 12px; border: 1px solid #dee2e6;">{name}</td>
          <td align="center" style="padding: 12px; border: 1px solid #dee2e6;">{box_id}</td>
          <td align="center" style="padding: 12px; border: 1px solid #dee2e6;">{shipment_id}</td>
          <td align="center" style="padding: 12px; border: 1px solid #dee2e6;">{quantity}</td>
          <td align="right" style="padding: 12px; border: 1px solid #dee2e6;">&#8377;{price:.2}</td>
          <td align="right" style="padding: 12px; border: 1px solid #dee2e6;">&#8377;{total:.2}</td>
        </tr>"#,
            box_id = escape(&display_or_dash(item.box_id.as_ref())),
            shipment_id = escape(&display_or_dash(item.shipment_id.as_ref())),
            quantity = item.quantity,
            price = item.price_at_purchase,
            total = item.line_total,
        );
    }

    let shipping = &invoice.shipping_address;

    format!(
        r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
  </head>
  <body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, 'Helvetica Neue', Arial, sans-serif; margin: 0; padding: 20px; background-color: #f8f9fa;">
    <div style="max-width: 900px; margin: 0 auto; background: white; padding: 20px;">
      <div style="background: linear-gradient(135deg, #afc08f 0%, #FCE7A3 100%); padding: 30px; border-radius: 8px 8px 0 0; margin-bottom: 30px;">
        <table width="100%" cellpadding="0" cellspacing="0">
          <tr>
            <td style="width: 150px; vertical-align: middle;">
              <img src="{LOGO_URL}" alt="Site Logo" width="150" height="150" style="border-radius: 8px; display: block;">
            </td>
            <td style="padding-left: 30px; vertical-align: middle;">
              <h1 style="margin: 0 0 8px 0; font-size: 32px; font-weight: 600; color: #2d3748;">Invoice</h1>
              <p style="margin: 0 0 16px 0; font-size: 16px; color: #4a5568;">Thank you for your order!</p>
              <div style="background: rgba(255,255,255,0.5); padding: 16px; border-radius: 6px;">
                <p style="margin: 0 0 6px 0; color: #2d3748;"><strong>Order ID:</strong> {order_id}</p>
                <p style="margin: 0 0 6px 0; color: #2d3748;"><strong>Date:</strong> {date}</p>
                <p style="margin: 0; color: #2d3748;"><strong>Status:</strong> <span style="text-transform: capitalize;">{status}</span></p>
              </div>
            </td>
          </tr>
        </table>
      </div>

      <h4 style="margin: 0 0 12px 0; font-size: 20px; font-weight: 500;">Shipping Address</h4>
      <p style="margin: 0 0 20px 0; line-height: 1.6;">
        {street}<br>
        {city}, {postcode}
      </p>

      <hr style="border: none; border-top: 1px solid #dee2e6; margin: 20px 0;">

      <h4 style="margin: 0 0 16px 0; font-size: 20px; font-weight: 500;">Items</h4>
      <table width="100%" cellpadding="0" cellspacing="0" style="border-collapse: collapse; margin-bottom: 20px;">
        <thead>
          <tr style="background-color: #f8f9fa;">
            <th align="center" style="padding: 12px; border: 1px solid #dee2e6; width: 120px;">Image</th>
            <th align="left" style="padding: 12px; border: 1px solid #dee2e6;">Product</th>
            <th align="center" style="padding: 12px; border: 1px solid #dee2e6;">Box ID</th>
            <th align="center" style="padding: 12px; border: 1px solid #dee2e6;">Shipment ID</th>
            <th align="center" style="padding: 12px; border: 1px solid #dee2e6;">Qty</th>
            <th align="right" style="padding: 12px; border: 1px solid #dee2e6;">Price</th>
            <th align="right" style="padding: 12px; border: 1px solid #dee2e6;">Total</th>
          </tr>
        </thead>
        <tbody>{rows}
        </tbody>
      </table>

      <div style="text-align: right;">
        <div style="display: inline-block; padding: 16px 24px; border: 1px solid #dee2e6; border-radius: 4px; background-color: #f8f9fa;">
          <h5 style="margin: 0; font-size: 18px; font-weight: 400;">
            Total: <strong style="font-weight: 700;">&#8377;{total:.2}</strong>
          </h5>
        </div>
      </div>
    </div>
    <div style="padding: 20px 30px; background: #f9fafb; text-align: center; color: #6b7280; font-size: 14px;">
      <p style="margin: 0;">Questions? Contact us at {SUPPORT_EMAIL}</p>
    </div>
  </body>
</html>
"#,
        order_id = escape(&invoice.order_id),
        date = escape(&invoice.created_at_formatted),
        status = escape(&invoice.status),
        street = escape(&shipping.street),
        city = escape(&shipping.city),
        postcode = escape(&shipping.postcode),
        total = invoice.total_amount,
    )
}

pub fn compose_tracking_html(
    order_id: &str,
    tracking_number: &str,
    carrier: &str,
    tracking_url: &str,
) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
  </head>
  <body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, 'Helvetica Neue', Arial, sans-serif; margin: 0; padding: 20px; background-color: #f8f9fa;">
    <div style="max-width: 600px; margin: 0 auto; background: white; border-radius: 12px; overflow: hidden;">
      <div style="background: linear-gradient(135deg, #afc08f 0%, #FCE7A3 100%); padding: 40px 30px; text-align: center;">
        <img src="{PACKAGE_ICON_URL}" alt="Package" width="40" height="40" style="display: block; margin: 0 auto 20px;">
        <h1 style="margin: 0; font-size: 28px; font-weight: 600; color: #2d3748;">Your Order Has Shipped!</h1>
        <p style="margin: 12px 0 0 0; font-size: 16px; color: #4a5568;">Your package is on its way</p>
      </div>

      <div style="padding: 40px 30px;">
        <div style="text-align: center; margin-bottom: 32px;">
          <p style="margin: 0 0 8px 0; color: #6b7280; font-size: 14px;">Order Number</p>
          <p style="margin: 0; font-size: 18px; font-weight: 600; color: #1f2937;">{order_id}</p>
        </div>

        <div style="background: #f9fafb; border: 2px solid #e5e7eb; border-radius: 8px; padding: 24px; margin-bottom: 24px;">
          <div style="text-align: center; margin-bottom: 20px;">
            <p style="margin: 0 0 8px 0; color: #6b7280; font-size: 14px; text-transform: uppercase;">Tracking Number</p>
            <p style="margin: 0; font-size: 20px; font-weight: 700; color: #1f2937; font-family: 'Courier New', monospace;">{tracking_number}</p>
          </div>
          <div style="text-align: center; margin-bottom: 20px;">
            <p style="margin: 0; color: #6b7280; font-size: 14px;"><strong>Carrier:</strong> {carrier}</p>
          </div>
          <div style="text-align: center;">
            <a href="{tracking_url}" style="display: inline-block; background: #afc08f; color: white; text-decoration: none; padding: 14px 32px; border-radius: 6px; font-weight: 600; font-size: 16px;">Track Your Package</a>
          </div>
        </div>

        <div style="background: #ecfdf5; border-left: 4px solid #10b981; padding: 16px; border-radius: 4px; margin-bottom: 24px;">
          <p style="margin: 0; color: #065f46; font-size: 14px; line-height: 1.6;">
            <strong>What's next?</strong><br>
            Your package is now with our delivery partner. You'll receive updates as it moves through the shipping process.
          </p>
        </div>

        <div style="text-align: center; padding-top: 20px; border-top: 1px solid #e5e7eb;">
          <p style="margin: 0; color: #6b7280; font-size: 14px;">
            Questions about your order?<br>
            <a href="mailto:{SUPPORT_EMAIL}" style="color: #afc08f; text-decoration: none; font-weight: 600;">Contact Support</a>
          </p>
        </div>
      </div>
    </div>
  </body>
</html>
"#,
        order_id = escape(order_id),
        tracking_number = escape(tracking_number),
        carrier = escape(carrier),
        tracking_url = escape(tracking_url),
    )
}

fn display_or_dash(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "-".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
