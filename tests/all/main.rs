mod amqp;
mod dispatch;
mod harness;
mod listener;
mod pool;
