//! The sending half of STREAM: a quote-driven pay runtime.

use crate::crypto::{generate_condition, random_condition};
use crate::error::PaymentError;
use crate::packet::{
    ConnectionCloseFrame, ConnectionNewAddressFrame, Frame, StreamErrorCode, StreamMoneyFrame,
    StreamPacket, StreamPacketBuilder,
};
use async_trait::async_trait;
use bytes::BytesMut;
use std::cmp::min;
use std::time::{Duration, Instant, SystemTime};
use streampay_packet::{
    Address, ErrorClass, ErrorCode, Fulfill, MaxPacketAmountDetails, PacketType as IlpPacketType,
    Prepare, PrepareBuilder, Reject,
};
use tracing::{debug, warn};

/// Stop the payment if no packet has been fulfilled for this long.
const MAX_TIME_SINCE_LAST_FULFILL: Duration = Duration::from_secs(30);
/// Give up after this many rejects in a row with no progress.
const MAX_CONSECUTIVE_REJECTS: u64 = 5;
/// Sequence numbers beyond this cannot safely be used with a single AES-GCM key.
const MAX_SEQUENCE: u64 = 1 << 31;

const PACKET_EXPIRY: Duration = Duration::from_secs(30);

/// Anything that can carry a Prepare toward its destination and bring back
/// the response.
#[async_trait]
pub trait IlpSender: Send + Sync {
    async fn send_prepare(&self, prepare: Prepare) -> Result<Fulfill, Reject>;
}

/// The fixed parameters of one payment attempt, all taken from the quote.
#[derive(Debug, Clone)]
pub struct PaymentPlan {
    pub source_address: Address,
    pub destination: Address,
    pub shared_secret: [u8; 32],
    /// Source units this attempt may spend, at most
    pub debit_amount: u64,
    /// Destination units to deliver; delivery short of this is a failure
    pub receive_amount: u64,
    pub max_packet_amount: u64,
    /// Destination units per source unit, floor-enforced per packet
    pub min_exchange_rate: f64,
    /// Destination asset by which ConnectionAssetDetails are judged
    pub expected_asset: Option<(String, u8)>,
}

/// Progress made by one call to [`pay`], valid whether or not it errored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaymentOutcome {
    pub amount_sent: u64,
    pub amount_delivered: u64,
}

#[derive(Debug)]
pub struct PayResult {
    pub outcome: PaymentOutcome,
    pub error: Option<PaymentError>,
}

impl PayResult {
    fn ok(outcome: PaymentOutcome) -> Self {
        PayResult {
            outcome,
            error: None,
        }
    }

    fn fail(outcome: PaymentOutcome, error: PaymentError) -> Self {
        PayResult {
            outcome,
            error: Some(error),
        }
    }
}

/// Drives a single streaming payment attempt until the plan is satisfied or
/// an error stops it. Partial progress is always reported.
pub async fn pay<S: IlpSender + ?Sized>(sender: &S, plan: &PaymentPlan) -> PayResult {
    let mut outcome = PaymentOutcome::default();

    if !plan.min_exchange_rate.is_finite() || plan.min_exchange_rate < 0.0 {
        return PayResult::fail(outcome, PaymentError::RateProbeFailed);
    }
    if plan.debit_amount == 0 || plan.receive_amount == 0 {
        return PayResult::ok(outcome);
    }

    let mut sequence: u64 = 1;
    let mut max_packet = plan.max_packet_amount.max(1);
    let mut consecutive_rejects: u64 = 0;
    let mut fulfilled_any = false;
    let mut new_connection = true;
    let mut last_fulfill = Instant::now();

    loop {
        if outcome.amount_sent >= plan.debit_amount
            || outcome.amount_delivered >= plan.receive_amount
        {
            break;
        }
        if last_fulfill.elapsed() >= MAX_TIME_SINCE_LAST_FULFILL {
            return PayResult::fail(outcome, PaymentError::IdleTimeout);
        }
        if sequence >= MAX_SEQUENCE {
            return PayResult::fail(outcome, PaymentError::InvalidGeneratedSequence);
        }

        // Clamp by the remaining delivery target so the last packet does not
        // overshoot what the receiver is still owed
        let debit_remaining = plan.debit_amount - outcome.amount_sent;
        let receive_remaining = plan.receive_amount - outcome.amount_delivered;
        let by_target = if plan.min_exchange_rate > 0.0 {
            (receive_remaining as f64 / plan.min_exchange_rate).ceil() as u64
        } else {
            debit_remaining
        };
        let amount = min(min(debit_remaining, max_packet), by_target.max(1));
        let minimum_destination = (amount as f64 * plan.min_exchange_rate).floor() as u64;

        let mut frames = vec![Frame::StreamMoney(StreamMoneyFrame {
            stream_id: 1,
            shares: 1,
        })];
        if new_connection {
            frames.push(Frame::ConnectionNewAddress(ConnectionNewAddressFrame {
                source_account: plan.source_address.clone(),
            }));
        }
        let stream_packet = StreamPacketBuilder {
            sequence,
            ilp_packet_type: IlpPacketType::Prepare,
            prepare_amount: minimum_destination,
            frames: &frames,
        }
        .build();
        sequence += 1;

        let data = stream_packet.into_encrypted(&plan.shared_secret);
        let execution_condition = generate_condition(&plan.shared_secret, &data);
        let prepare = PrepareBuilder {
            destination: plan.destination.clone(),
            amount,
            expires_at: SystemTime::now() + PACKET_EXPIRY,
            execution_condition: &execution_condition,
            data: &data,
        }
        .build();
        debug!(
            "Sending STREAM packet {} with amount {} (minimum destination: {})",
            sequence - 1,
            amount,
            minimum_destination
        );

        match sender.send_prepare(prepare).await {
            Ok(fulfill) => {
                fulfilled_any = true;
                new_connection = false;
                consecutive_rejects = 0;
                last_fulfill = Instant::now();
                outcome.amount_sent += amount;

                match parse_response(&plan.shared_secret, fulfill.data()) {
                    Some(response) => {
                        let claimed = response.prepare_amount();
                        outcome.amount_delivered += claimed;
                        if claimed < minimum_destination {
                            return PayResult::fail(
                                outcome,
                                PaymentError::InsufficientExchangeRate,
                            );
                        }
                        if let Some(error) = check_response_frames(plan, &outcome, &response) {
                            return PayResult::fail(outcome, error);
                        }
                    }
                    None => {
                        // A fulfill without a readable STREAM response still
                        // moved the money; assume the minimum arrived.
                        warn!("Fulfill carried no readable STREAM packet");
                        outcome.amount_delivered += minimum_destination;
                    }
                }
            }
            Err(reject) => {
                if let Some(error) = classify_reject(&reject, fulfilled_any, &mut max_packet) {
                    return PayResult::fail(outcome, error);
                }
                consecutive_rejects += 1;
                if consecutive_rejects >= MAX_CONSECUTIVE_REJECTS {
                    return PayResult::fail(
                        outcome,
                        PaymentError::ConnectorError(format!(
                            "{} rejects in a row, last: {}",
                            consecutive_rejects,
                            reject.code()
                        )),
                    );
                }
            }
        }
    }

    close_connection(sender, plan, sequence).await;
    PayResult::ok(outcome)
}

fn parse_response(shared_secret: &[u8; 32], data: &[u8]) -> Option<StreamPacket> {
    if data.is_empty() {
        return None;
    }
    StreamPacket::from_encrypted(&shared_secret[..], BytesMut::from(data)).ok()
}

fn check_response_frames(
    plan: &PaymentPlan,
    outcome: &PaymentOutcome,
    response: &StreamPacket,
) -> Option<PaymentError> {
    for frame in response.frames() {
        match frame {
            Frame::ConnectionAssetDetails(details) => {
                if let Some((ref code, scale)) = plan.expected_asset {
                    if details.source_asset_code != *code || details.source_asset_scale != scale {
                        return Some(PaymentError::DestinationAssetConflict);
                    }
                }
            }
            Frame::StreamMaxMoney(frame) => {
                if frame.receive_max < plan.receive_amount {
                    return Some(PaymentError::IncompatibleReceiveMax);
                }
            }
            Frame::ConnectionClose(_) | Frame::StreamClose(_) => {
                if outcome.amount_delivered < plan.receive_amount {
                    return Some(PaymentError::ClosedByReceiver);
                }
            }
            _ => {}
        }
    }
    None
}

/// Maps a reject to a terminal error, or returns None when the attempt
/// should continue (possibly with an adjusted packet ceiling).
fn classify_reject(
    reject: &Reject,
    fulfilled_any: bool,
    max_packet: &mut u64,
) -> Option<PaymentError> {
    match reject.code() {
        ErrorCode::F08_AMOUNT_TOO_LARGE => {
            if let Ok(details) = MaxPacketAmountDetails::from_bytes(reject.data()) {
                if details.max_amount() > 0 {
                    *max_packet = min(*max_packet, details.max_amount());
                    return None;
                }
            }
            // No usable hint: halve and keep trying
            *max_packet = (*max_packet / 2).max(1);
            None
        }
        ErrorCode::F99_APPLICATION_ERROR => Some(PaymentError::InsufficientExchangeRate),
        ErrorCode::F02_UNREACHABLE if !fulfilled_any => Some(PaymentError::EstablishmentFailed),
        ErrorCode::F05_WRONG_CONDITION | ErrorCode::F06_UNEXPECTED_PAYMENT => Some(
            PaymentError::ReceiverProtocolViolation(reject.code().to_string()),
        ),
        code if code.class() == ErrorClass::Final => {
            Some(PaymentError::ConnectorError(code.to_string()))
        }
        // Temporary and relative errors are retried in-loop until the
        // consecutive-reject cap trips
        _ => None,
    }
}

async fn close_connection<S: IlpSender + ?Sized>(sender: &S, plan: &PaymentPlan, sequence: u64) {
    let stream_packet = StreamPacketBuilder {
        sequence,
        ilp_packet_type: IlpPacketType::Prepare,
        prepare_amount: 0,
        frames: &[Frame::ConnectionClose(ConnectionCloseFrame {
            code: StreamErrorCode::NoError,
            message: String::new(),
        })],
    }
    .build();
    let data = stream_packet.into_encrypted(&plan.shared_secret);
    let prepare = PrepareBuilder {
        destination: plan.destination.clone(),
        amount: 0,
        // Deliberately unfulfillable
        execution_condition: &random_condition(),
        expires_at: SystemTime::now() + PACKET_EXPIRY,
        data: &data,
    }
    .build();
    debug!("Closing STREAM connection");
    let _ = sender.send_prepare(prepare).await;
}
